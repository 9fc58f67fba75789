mod common;
mod data;
mod handshake;
mod retransmit;
