//! mintbot entry point.
//!
//! Loads config, restores thread snapshots and known users, then runs the
//! Telegram poller, the update dispatcher, periodic maintenance and the
//! optional console until Ctrl-C or `quit`.

use mintbot::bot::access::AccessPolicy;
use mintbot::bot::backend::OpenAiBackend;
use mintbot::bot::config::{load_config, load_system_prompt, resolve_config_path};
use mintbot::bot::console::run_console;
use mintbot::bot::context::HistoryBudget;
use mintbot::bot::controller::{BotContext, BotController};
use mintbot::bot::generator::ResponseGenerator;
use mintbot::bot::maintenance::{drain_handlers, persist_state, Maintenance};
use mintbot::bot::profile_tool::UpdateUserProfileTool;
use mintbot::bot::structured_log::{EventType, LogLevel, StructuredLogger};
use mintbot::bot::telegram::{run_poller, TelegramApi};
use mintbot::bot::threads::ThreadRegistry;
use mintbot::bot::users::{LoadReport, UserStore};
use mintbot::tools::ToolRegistry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path(std::env::args().nth(1));
    let config = match load_config(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[mintbot] {e} ({})", config_path.display());
            std::process::exit(1);
        }
    };

    let run_id = format!(
        "{}-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        &uuid::Uuid::new_v4().to_string()[..8]
    );
    let logger = StructuredLogger::new(config.logging.clone(), &run_id);

    // Best-effort cleanup of old log files (non-blocking)
    {
        let cleanup_logger = logger.clone();
        std::thread::spawn(move || cleanup_logger.cleanup_old_logs());
    }

    logger.info(
        EventType::Lifecycle,
        &format!(
            "Starting (config {}, model {})",
            config_path.display(),
            config.backend.model
        ),
    );

    let system_prompt = load_system_prompt(Path::new(&config.bot.system_prompt_path)).await;

    let (user_store, user_report) = match UserStore::load(&config.users.known_users_path).await {
        Ok(loaded) => loaded,
        Err(e) => {
            logger.error(
                EventType::UserStore,
                &format!("could not read known users, starting empty: {e:#}"),
            );
            (
                UserStore::new(&config.users.known_users_path),
                LoadReport::default(),
            )
        }
    };
    let users = Arc::new(Mutex::new(user_store));

    let mut registry = ThreadRegistry::new(HistoryBudget::new(
        config.conversation.max_history_messages,
        config.conversation.context_window_tokens,
    ));
    match registry
        .load(
            Path::new(&config.conversation.history_path),
            chrono::Utc::now(),
            config.conversation.max_age(),
        )
        .await
    {
        Ok(report) => {
            for warning in &report.warnings {
                logger.warn(EventType::Thread, warning);
            }
            logger.info(
                EventType::Thread,
                &format!(
                    "restored {} threads ({} expired)",
                    report.restored, report.evicted
                ),
            );
        }
        Err(e) => logger.error(
            EventType::Thread,
            &format!("could not restore thread snapshot: {e:#}"),
        ),
    }
    let threads = Arc::new(Mutex::new(registry));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(UpdateUserProfileTool::new(
        users.clone(),
        logger.clone(),
    )));

    let backend = Arc::new(OpenAiBackend::new(&config.backend)?);
    logger.info(
        EventType::Lifecycle,
        &format!("completion endpoint: {}", backend.endpoint()),
    );
    let generator = ResponseGenerator::new(
        backend,
        Arc::new(tools),
        config.backend.clone(),
        logger.clone(),
    );

    let telegram = Arc::new(TelegramApi::new(&config.telegram)?);
    let bot_username = match telegram.get_me().await {
        Ok(me) => {
            logger.info(
                EventType::Lifecycle,
                &format!("connected as @{}", me.username.as_deref().unwrap_or("?")),
            );
            me.username
        }
        Err(e) => {
            logger.warn(
                EventType::Lifecycle,
                &format!("getMe failed, addressed commands will not match: {e:#}"),
            );
            None
        }
    };

    let access = AccessPolicy::new(config.bot.allowed_chat_ids.iter().copied());
    if access.is_empty() {
        logger.warn(
            EventType::AccessDenied,
            "allowed_chat_ids is empty; every chat will be refused",
        );
    }

    let ctx = Arc::new(BotContext {
        system_prompt,
        access,
        threads: threads.clone(),
        users: users.clone(),
        generator,
        transport: telegram.clone(),
        logger: logger.clone(),
        bot_username,
        config: config.clone(),
    });
    let controller = BotController::new(ctx);
    controller.report_store_load(&user_report);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (update_tx, mut update_rx) = mpsc::channel(64);

    let poller = tokio::spawn(run_poller(
        telegram,
        config.telegram.clone(),
        update_tx,
        shutdown_rx.clone(),
        logger.clone(),
    ));

    let maintenance = tokio::spawn(
        Maintenance {
            threads: threads.clone(),
            users: users.clone(),
            max_age: config.conversation.max_age(),
            eviction_interval: Duration::from_secs(config.conversation.eviction_interval_secs),
            flush_interval: Duration::from_secs(config.users.flush_interval_secs),
            logger: logger.clone(),
        }
        .run(shutdown_rx.clone()),
    );

    if config.bot.enable_console_interface {
        tokio::spawn(run_console(
            controller.clone(),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        ));
    }

    logger.info(EventType::Lifecycle, "Ready");

    let mut handlers = JoinSet::new();
    let mut shutdown_watch = shutdown_rx.clone();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            msg = update_rx.recv() => match msg {
                Some(msg) => {
                    let controller = controller.clone();
                    handlers.spawn(async move { controller.handle_update(msg).await });
                }
                None => break,
            },
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    logger.error(EventType::Error, &format!("update handler failed: {e}"));
                }
            }
            _ = &mut ctrl_c => {
                logger.info(EventType::Lifecycle, "Ctrl-C received, shutting down");
                break;
            }
            _ = shutdown_watch.changed() => break,
        }
    }

    // ── Shutdown ────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);

    drain_handlers(&mut handlers, config.shutdown_grace(), &logger).await;

    let _ = poller.await;
    let _ = maintenance.await;

    persist_state(
        &threads,
        &users,
        Path::new(&config.conversation.history_path),
        &logger,
    )
    .await;

    logger.log(
        &logger
            .event(EventType::Lifecycle, LogLevel::Info)
            .with_detail("stopped"),
    );
    eprintln!("[mintbot] Stopped");

    // Flush any buffered log events before exiting
    logger.flush();

    Ok(())
}
