mod common;
mod joiner;
mod petition;
