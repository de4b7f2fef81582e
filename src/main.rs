mod application;
mod core;
mod infrastructure;
mod interfaces;
mod listeners;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use application::config::AppConfig;
use application::switchboard::Switchboard;
use crate::core::drop::{DropRepository, OwnerTier, TokenDrop, TokenKind};
use crate::core::token::Token;
use infrastructure::notification::{EmailSender, SmsSender, WebhookSender};
use infrastructure::repository::{FileDropRepository, InMemoryDropRepository};
use interfaces::cli::{Cli, Commands, KindArg};
use listeners::dns::DnsListener;
use listeners::mysql::MysqlListener;
use listeners::wireguard::WireguardListener;

fn local_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn build_repository(config: &AppConfig) -> Arc<dyn DropRepository> {
    if config.storage.persistent {
        Arc::new(FileDropRepository::new(
            &config.storage.db_path,
            config.storage.hit_retention,
        ))
    } else {
        Arc::new(InMemoryDropRepository::new(config.storage.hit_retention))
    }
}

fn build_switchboard(config: &AppConfig, repo: Arc<dyn DropRepository>) -> Switchboard {
    let mut board = Switchboard::new(
        repo,
        Arc::new(EmailSender::new(
            &config.alerting.smtp_relay,
            &config.alerting.smtp_from,
        )),
        Arc::new(WebhookSender::new()),
        Arc::new(SmsSender::new(&config.alerting.sms_gateway_url)),
        config.alerting.failure_threshold,
        Duration::from_secs(config.alerting.send_timeout_secs),
    );
    board.register_input_channel(DnsListener::CHANNEL);
    board.register_input_channel(MysqlListener::CHANNEL);
    board.register_input_channel(WireguardListener::CHANNEL);
    board
}

async fn serve(config: AppConfig, repo: Arc<dyn DropRepository>) -> Result<()> {
    let board = Arc::new(build_switchboard(&config, Arc::clone(&repo)));

    let dns = Arc::new(DnsListener::new(config.dns.clone(), Arc::clone(&board)));
    let mysql = Arc::new(MysqlListener::new(config.mysql.clone(), Arc::clone(&board)));

    let drops = repo.all().await?;
    let wireguard = Arc::new(WireguardListener::new(
        &config.wireguard,
        &drops,
        Arc::clone(&board),
    )?);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(dns.serve());
    tasks.spawn(mysql.serve());
    tasks.spawn(wireguard.serve());

    tokio::select! {
        result = tasks.join_next() => {
            match result {
                Some(Ok(Err(e))) => bail!("listener failed: {}", e),
                Some(Err(e)) => bail!("listener task panicked: {}", e),
                _ => Ok(()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();

    let config_path = PathBuf::from("config.json");
    let config = if config_path.exists() {
        AppConfig::load(&config_path)?
    } else {
        info!("Creating default configuration at {:?}", config_path);
        AppConfig::init_default(&config_path)?
    };

    let repo = build_repository(&config);

    match cli.command {
        Commands::Serve => {
            serve(config, repo).await?;
        }
        Commands::Create {
            kind,
            memo,
            email,
            webhook,
            sms,
            domain,
            peer_key,
            registered,
        } => {
            let kind = match kind {
                KindArg::Dns => TokenKind::Dns,
                KindArg::DirectoryListing => TokenKind::DirectoryListing,
                KindArg::CommandInjection => TokenKind::CommandInjection,
                KindArg::ClonedSite => TokenKind::ClonedSite {
                    domain: domain.context("--domain is required for cloned-site drops")?,
                },
                KindArg::Mysql => TokenKind::Mysql,
                KindArg::Wireguard => TokenKind::Wireguard {
                    peer_public_key: peer_key
                        .context("--peer-key is required for wireguard drops")?,
                },
            };
            let tier = if registered {
                OwnerTier::Registered
            } else {
                OwnerTier::Anonymous
            };

            let mut drop = TokenDrop::new(kind, memo, tier);
            if let Some(email) = email {
                drop.alert_email_enabled = true;
                drop.alert_email_recipient = Some(email);
            }
            if let Some(webhook) = webhook {
                drop.alert_webhook_enabled = true;
                drop.alert_webhook_url = Some(webhook);
            }
            if let Some(sms) = sms {
                drop.alert_sms_enabled = true;
                drop.alert_sms_number = Some(sms);
            }
            repo.save(&drop).await?;

            println!("Token: {}", drop.token);
            println!("Auth: {}", drop.auth);
            println!("Created: {}", local_time(drop.created_at));
        }
        Commands::List => {
            let drops = repo.all().await?;
            if drops.is_empty() {
                println!("No drops found.");
            } else {
                println!("Found {} drops:", drops.len());
                for drop in drops {
                    println!("Token: {}", drop.token);
                    println!("Memo: {}", drop.memo);
                    println!("Kind: {:?}", drop.kind);
                    println!("Created: {}", local_time(drop.created_at));
                    println!(
                        "Channels: {}",
                        drop.enabled_channels()
                            .iter()
                            .map(|c| c.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    println!("---");
                }
            }
        }
        Commands::History { token } => {
            let token = Token::parse(&token)?;
            let hits = repo.hits(&token).await?;
            if hits.is_empty() {
                println!("No hits recorded.");
            }
            for hit in hits {
                println!(
                    "#{} {} via {} from {}",
                    hit.seq,
                    local_time(hit.time),
                    hit.input_channel,
                    hit.src_ip
                );
                for (key, value) in &hit.additional_info {
                    println!("  {}: {}", key, value);
                }
            }
        }
        Commands::Remove { token } => {
            let token = Token::parse(&token)?;
            repo.remove(&token).await?;
            println!("Drop {} removed.", token);
        }
    }

    Ok(())
}
