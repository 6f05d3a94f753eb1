pub mod args;

use clap::Parser;

pub use args::{Arguments, Species};

pub fn parse() -> Arguments {
    Arguments::parse()
}
