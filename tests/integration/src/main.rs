mod helpers;

mod convergence;
mod failover;
mod handshake;
mod redirect;
