use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about = "Queries a single UDP sensor and prints its reading")]
pub struct Args {
    /// Device address, e.g. 192.168.0.56:16083
    pub address: String,

    /// Send the datalogger's `hello` request instead of `ping`
    #[arg(long)]
    pub hello: bool,
}
