pub mod dedupe;
pub mod hasher;
pub mod scanner;
