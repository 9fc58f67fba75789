mod common;
mod cookie;
mod session;
