use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nsq")]
#[command(version)]
#[command(about = "Publish to and subscribe from nsqd")]
pub struct Cli {
    /// nsqd TCP address (host:port); repeat for several daemons
    #[arg(short, long = "nsqd", default_value = "127.0.0.1:4150")]
    pub nsqd: Vec<String>,

    /// Delay in milliseconds before a failed message is redelivered
    #[arg(long, default_value_t = 90_000)]
    pub requeue_delay_ms: u64,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Publish one message
    Pub { topic: String, body: String },
    /// Publish several messages in one MPUB
    Mpub {
        topic: String,
        #[arg(required = true)]
        bodies: Vec<String>,
    },
    /// Publish one message delivered after a delay
    Dpub {
        topic: String,
        body: String,
        /// Delay in milliseconds
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
    },
    /// Print messages from a channel until Ctrl-C
    Sub {
        topic: String,
        channel: String,
        /// Requeue messages whose body contains this text
        #[arg(long)]
        reject: Option<String>,
    },
}
