use sockpass_common::duplicate::Backend;

static HELP_STR_LOG: &str = "Optional log path value. If not provided, logs \
                             will be placed in /tmp/sockpass-$ROLE-$PID.log";

#[derive(clap::Parser, Debug)]
#[command(
    name = "sockpass",
    version,
    about = "sockpass",
    long_about = "Opens a loopback TCP connection, hands one end of it to a \
                  freshly spawned copy of itself through shared memory and a \
                  named semaphore, then proves the child can talk on it"
)]
pub enum Args {
    /// Set up the connection and hand it to a child
    Parent {
        #[arg(
            long,
            short,
            value_name = "BACKEND",
            help = "How the socket is duplicated for the child: scm-rights or \
                    pidfd",
            default_value = "scm-rights"
        )]
        backend: Backend,

        #[arg(
            long,
            short,
            value_name = "MESSAGE",
            help = "First frame sent to the child over the shared connection",
            default_value = "Are we not men?"
        )]
        message: String,

        #[arg(
            long = "child-arg",
            value_name = "ARG",
            allow_hyphen_values = true,
            help = "Extra argument for the child's command line, placed \
                    before the relay and signal names. Repeatable"
        )]
        child_args: Vec<String>,

        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<String>,

        #[arg(long, help = "Log to stderr instead of a file")]
        stderr: bool,
    },
    /// Receive the connection from a parent. Started by `parent`, not by hand
    Child {
        #[arg(value_name = "RELAY_NAME")]
        relay_name: String,

        #[arg(value_name = "SIGNAL_NAME")]
        signal_name: String,

        #[arg(
            long,
            short,
            value_name = "REPLY",
            help = "Frame sent back to the parent",
            default_value = "We are devo"
        )]
        reply: String,

        #[arg(
            long,
            value_name = "MILLISECONDS",
            help = "Give up waiting for the parent after this long. Waits \
                    forever if not set"
        )]
        wait_timeout_ms: Option<u64>,

        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<String>,

        #[arg(long, help = "Log to stderr instead of a file")]
        stderr: bool,
    },
}

impl Args {
    pub fn role(&self) -> &'static str {
        match self {
            Args::Parent { .. } => "parent",
            Args::Child { .. } => "child",
        }
    }
}
