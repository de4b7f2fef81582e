use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Dns,
    DirectoryListing,
    CommandInjection,
    ClonedSite,
    Mysql,
    Wireguard,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run all protocol listeners
    Serve,

    /// Create a new token drop
    Create {
        /// Token kind
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Reminder shown in alerts
        #[arg(short, long)]
        memo: String,

        /// Email recipient for alerts
        #[arg(long)]
        email: Option<String>,

        /// Webhook URL for alerts
        #[arg(long)]
        webhook: Option<String>,

        /// SMS number for alerts
        #[arg(long)]
        sms: Option<String>,

        /// Cloned-site domain (cloned-site kind only)
        #[arg(long)]
        domain: Option<String>,

        /// Hex-encoded peer public key (wireguard kind only)
        #[arg(long)]
        peer_key: Option<String>,

        /// Create as a registered-tier drop (larger alert quota)
        #[arg(long)]
        registered: bool,
    },

    /// List all drops
    List,

    /// Show the recorded hits for a token
    History {
        /// Token value
        token: String,
    },

    /// Remove a drop and its history
    Remove {
        /// Token value
        token: String,
    },
}
