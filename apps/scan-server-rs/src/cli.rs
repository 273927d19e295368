use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "scan-server-rs",
    version,
    about = "Parcel distress scanner query surface"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8090)]
    pub port: u16,
}
