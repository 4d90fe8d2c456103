//! `wselector` - browse the wallpaper catalog, download wallpapers, and set them as background.

mod cli;
mod http;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();

    if let Err(err) = cli.execute() {
        eprintln!("wselector: {err:#}");
        std::process::exit(1);
    }
}
