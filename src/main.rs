//! sms2mail daemon
//!
//! Forwards SMS received by ModemManager to email over SMTP.

use anyhow::Context as _;
use clap::Parser;
use sms2mail::config::{
    Context, DaemonConfig, TlsMode, DEFAULT_MAX_ATTEMPTS, DEFAULT_SHUTDOWN_GRACE_SECS,
};
use sms2mail::daemon;
use sms2mail::logging;
use sms2mail::mailer::{MailTransport, SmtpMailer};
use sms2mail::modem::{ModemManagerBus, ModemManagerStore, SmsStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// sms2mail - SMS to email forwarder
#[derive(Parser)]
#[command(name = "sms2mail", version)]
#[command(about = "Forward SMS received by ModemManager to email")]
struct Cli {
    /// Rules document (YAML)
    #[arg(
        short = 'c',
        long = "config",
        env = "SMS2MAIL_CONFIG",
        default_value = "/etc/sms2mail.yaml"
    )]
    config: PathBuf,

    /// SMTP server host name
    #[arg(long, env = "SMS2MAIL_SMTP_SERVER")]
    smtp_server: String,

    #[arg(
        long,
        env = "SMS2MAIL_SMTP_PORT",
        default_value_t = 587,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    smtp_port: u16,

    #[arg(long, env = "SMS2MAIL_SMTP_USER")]
    smtp_user: String,

    /// File holding the SMTP password
    #[arg(long, env = "SMS2MAIL_SMTP_PASSWORD_FILE")]
    smtp_password_file: PathBuf,

    /// Sender mailbox, e.g. "SMS Gateway <sms@example.org>"
    #[arg(long, env = "SMS2MAIL_MAIL_FROM")]
    mail_from: String,

    #[arg(long, env = "SMS2MAIL_SMTP_TLS", value_enum, default_value_t = TlsMode::Opportunistic)]
    smtp_tls: TlsMode,

    /// SMTP attempts per SMS, including the first
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Seconds in-flight deliveries get to finish on shutdown
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS)]
    shutdown_grace_secs: u64,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

impl Cli {
    fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            rules_path: self.config.clone(),
            smtp_host: self.smtp_server.clone(),
            smtp_port: self.smtp_port,
            smtp_user: self.smtp_user.clone(),
            smtp_password_file: self.smtp_password_file.clone(),
            mail_from: self.mail_from.clone(),
            tls: self.smtp_tls,
            max_attempts: self.max_attempts,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    let ctx = load_context(&cli)
        .with_context(|| format!("invalid configuration ({})", cli.config.display()))?;

    if cli.check {
        cmd_check(&ctx);
        return Ok(());
    }

    cmd_run(ctx).await
}

// ============================================================================
// Commands
// ============================================================================

fn load_context(cli: &Cli) -> sms2mail::Result<Context> {
    Ok(Context::from_config(&cli.daemon_config())?)
}

fn cmd_check(ctx: &Context) {
    let default = ctx
        .rules
        .default_recipient()
        .map(|mailbox| mailbox.to_string())
        .unwrap_or_else(|| "none".to_string());

    println!(
        "Configuration OK: {} rules, default recipient: {}",
        ctx.rules.len(),
        default
    );
    for pattern in ctx.rules.patterns() {
        if let Some(rule) = ctx.rules.get(pattern) {
            println!("  {:<16} -> {}", pattern, rule.to);
        }
    }
}

// ============================================================================
// Daemon Loop
// ============================================================================

async fn cmd_run(ctx: Context) -> anyhow::Result<()> {
    let ctx = Arc::new(ctx);
    let options = &ctx.rules.options;

    let connector = ModemManagerBus::new(options.process_existing);
    let transport: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(ctx.smtp.clone()));
    let store: Option<Arc<dyn SmsStore>> = if options.delete_after_sending {
        Some(Arc::new(ModemManagerStore))
    } else {
        None
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    daemon::run(ctx, connector, transport, store, shutdown_rx).await;
    Ok(())
}
