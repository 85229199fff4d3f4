use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use reqwest::Client;
use teloxide::prelude::*;
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tokio_cron_scheduler::JobScheduler;

use crate::{
    ai::{AnalysisGateway, HttpAnalysisGateway},
    config::AppConfig,
    db::{self, SqliteKeyValueStore},
    domain::QueueSnapshot,
    infrastructure::{
        directories::ResolvedPaths,
        notifier::{format_batch_summary, notify_admin},
        trigger::{Trigger, TriggerListener},
    },
    tasks::{
        scheduler::{configure_jobs, CronJobs, JobCallback},
        QueueController, QueueStore,
    },
    telegram::TelegramService,
};

pub struct ShareQueueApp {
    _paths: ResolvedPaths,
    scheduler: JobScheduler,
    controller: Arc<QueueController>,
    telegram: TelegramService,
    kv: Arc<SqliteKeyValueStore>,
    shutdown: Trigger,
    config: Arc<AppConfig>,
    bot: Bot,
}

impl ShareQueueApp {
    pub async fn initialize(
        config: AppConfig,
        paths: ResolvedPaths,
        shutdown: Trigger,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let pool = db::init_pool(&paths.db_path).await?;
        let kv = Arc::new(SqliteKeyValueStore::new(pool));
        let store = QueueStore::new(kv.clone());

        let http_client = Client::builder()
            .user_agent(format!("share-queue-rust/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let gateway: Arc<dyn AnalysisGateway> = Arc::new(HttpAnalysisGateway::new(
            http_client,
            config.gateway.clone(),
        ));

        let controller =
            Arc::new(QueueController::initialize(store, gateway, config.pipeline.clone()).await?);

        let bot = Bot::new(&config.telegram_bot_token);
        let telegram = TelegramService::new(bot.clone(), config.clone(), controller.clone());

        let scheduler = configure_jobs(vec![
            CronJobs {
                label: "batch",
                specs: config.scheduler.batch_cron_specs.clone(),
                callback: build_batch_callback(bot.clone(), config.clone(), controller.clone()),
            },
            CronJobs {
                label: "cleanup",
                specs: config.scheduler.cleanup_cron_specs.clone(),
                callback: build_cleanup_callback(controller.clone()),
            },
        ])
        .await?;

        Ok(Self {
            _paths: paths,
            scheduler,
            controller,
            telegram,
            kv,
            shutdown,
            config,
            bot,
        })
    }

    pub async fn run(self) -> Result<()> {
        let ShareQueueApp {
            _paths: _,
            mut scheduler,
            controller,
            telegram,
            kv,
            shutdown,
            config,
            bot,
        } = self;

        tracing::info!("공유 대기열 봇 (Rust) 시작");

        let started_at = Utc::now()
            .with_timezone(&config.display_timezone())
            .format("%Y-%m-%d %H:%M:%S");
        let snapshot = controller.snapshot();
        notify_admin(
            &bot,
            config.as_ref(),
            &format!(
                "공유 대기열 봇이 시작되었습니다.\n시작 시각: {started_at}\n대기열: {}개 (처리 가능 {}개)",
                snapshot.total, snapshot.processable
            ),
        )
        .await;

        let observer = spawn_snapshot_logger(controller.subscribe(), shutdown.subscribe());
        let mut shutdown_listener = shutdown.subscribe();
        let shutdown_timeout = Duration::from_secs(5);
        let mut telegram_future = Box::pin(telegram.run(shutdown.subscribe()));
        let mut telegram_completed = false;

        tokio::select! {
            _ = shutdown_listener.notified() => {
                tracing::info!("종료 신호 감지 (CTRL+C / SIGTERM)");
            }
            res = &mut telegram_future => {
                telegram_completed = true;
                if let Err(err) = res {
                    tracing::error!(?err, "Telegram dispatcher 종료 중 오류");
                } else {
                    tracing::info!("Telegram dispatcher 정상 종료");
                }
            }
        }

        shutdown.trigger();
        controller.cancel_processing();

        if !telegram_completed {
            let wait = tokio::time::sleep(shutdown_timeout);
            tokio::pin!(wait);
            tokio::select! {
                res = &mut telegram_future => {
                    if let Err(err) = res {
                        tracing::error!(?err, "Telegram dispatcher 종료 중 오류");
                    }
                }
                _ = &mut wait => {
                    tracing::warn!(
                        target: "telegram",
                        "Telegram dispatcher did not stop within {:?}; forcing exit",
                        shutdown_timeout
                    );
                }
            }
        }

        match timeout(shutdown_timeout, scheduler.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(?err, "스케줄러 종료 실패");
            }
            Err(_) => {
                tracing::warn!(
                    target: "scheduler",
                    "스케줄러 종료가 {:?} 내에 완료되지 않았습니다.",
                    shutdown_timeout
                );
            }
        }

        if !controller.wait_idle(shutdown_timeout).await {
            tracing::warn!(
                target: "controller",
                "진행 중인 분석이 {:?} 내에 끝나지 않았습니다. 남은 항목은 다음 실행 시 대기 상태로 복구됩니다.",
                shutdown_timeout
            );
        }

        if timeout(shutdown_timeout, kv.close()).await.is_err() {
            tracing::warn!(
                target: "db",
                "대기열 저장소 정리가 {:?} 내에 완료되지 않았습니다.",
                shutdown_timeout
            );
        }

        if timeout(shutdown_timeout, observer).await.is_err() {
            tracing::warn!(target: "controller", "대기열 상태 관찰 작업이 종료되지 않았습니다.");
        }

        tracing::info!("봇 종료 완료");
        notify_admin(&bot, config.as_ref(), "공유 대기열 봇이 종료되었습니다.").await;
        Ok(())
    }
}

fn build_batch_callback(
    bot: Bot,
    config: Arc<AppConfig>,
    controller: Arc<QueueController>,
) -> JobCallback {
    Arc::new(move || {
        let bot = bot.clone();
        let config = config.clone();
        let controller = controller.clone();
        Box::pin(async move {
            if controller.processable_items().is_empty() {
                tracing::debug!(target: "scheduler", "no processable items; batch skipped");
                return;
            }
            let run = controller.process_batch().await;
            match run.summary() {
                None => {
                    tracing::debug!(target: "scheduler", "batch already running; tick skipped");
                }
                Some(summary) if summary.processed > 0 => {
                    notify_admin(&bot, config.as_ref(), &format_batch_summary(summary)).await;
                }
                Some(_) => {}
            }
        })
    })
}

fn build_cleanup_callback(controller: Arc<QueueController>) -> JobCallback {
    Arc::new(move || {
        let controller = controller.clone();
        Box::pin(async move {
            let expired = controller.prune_expired().await;
            let removed = controller.cleanup_completed_items().await;
            tracing::info!(target: "scheduler", expired, removed, "queue cleanup finished");
        })
    })
}

/// Logs queue state transitions until shutdown.
fn spawn_snapshot_logger(
    mut snapshots: watch::Receiver<QueueSnapshot>,
    mut shutdown: TriggerListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = *snapshots.borrow_and_update();
                    tracing::debug!(
                        target: "controller",
                        total = snapshot.total,
                        pending = snapshot.pending,
                        analyzing = snapshot.analyzing,
                        completed = snapshot.completed,
                        failed = snapshot.failed,
                        progress = snapshot.progress,
                        processing = snapshot.is_processing,
                        "queue state changed"
                    );
                }
            }
        }
    })
}
