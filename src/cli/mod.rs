pub mod args;

use clap::Parser;

pub use args::{Arguments, Backend};

pub fn parse() -> Arguments {
    Arguments::parse()
}
