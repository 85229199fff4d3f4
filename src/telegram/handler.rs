use std::sync::Arc;

use anyhow::Result;
use teloxide::{
    dispatching::Dispatcher, error_handlers::LoggingErrorHandler, prelude::*, types::Message,
    update_listeners, utils::command::BotCommands,
};

use crate::{
    config::AppConfig,
    domain::BatchRun,
    infrastructure::{notifier::format_batch_summary, trigger::TriggerListener},
    tasks::QueueController,
};

use super::{
    types::{AppState, BotResult, QueueCommand},
    utils::{
        describe_error, extract_title, extract_urls, format_item_line, format_snapshot,
        resolve_item_id, short_id, user_to_i64, IdLookup,
    },
};

/// Share intake: links sent to the bot are queued, commands drive the queue.
pub struct TelegramService {
    bot: Bot,
    state: Arc<AppState>,
}

#[derive(Clone, Copy)]
enum BatchKind {
    Process,
    Retry,
}

impl TelegramService {
    pub fn new(bot: Bot, config: Arc<AppConfig>, controller: Arc<QueueController>) -> Self {
        if config.admin_user_id.is_none() && config.allowed_user_ids.is_empty() {
            tracing::warn!(
                target: "telegram",
                "ADMIN_USER_ID와 ALLOWED_USER_IDS가 비어 있어 모든 사용자가 대기열을 사용할 수 있습니다"
            );
        }
        let state = Arc::new(AppState { config, controller });
        Self { bot, state }
    }

    pub async fn run(&self, mut shutdown: TriggerListener) -> Result<()> {
        self.bot
            .set_my_commands(QueueCommand::bot_commands())
            .await?;
        let me = self.bot.get_me().await?;
        if let Some(expected_username) = &self.state.config.bot_username {
            if me.username.as_deref() != Some(expected_username.as_str()) {
                tracing::warn!(
                    target: "telegram",
                    expected = expected_username.as_str(),
                    actual = ?me.username,
                    "환경변수 BOT_USERNAME과 실제 봇 계정이 일치하지 않습니다"
                );
            }
        }
        tracing::info!(
            target: "telegram",
            bot_id = me.id.0,
            username = ?me.username,
            "Telegram 봇 연결 완료"
        );

        let handler = Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<QueueCommand>()
                    .endpoint(Self::on_command),
            )
            .branch(dptree::endpoint(Self::on_shared_message));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.state.clone()])
            .default_handler(|update| async move {
                tracing::debug!(target: "telegram", ?update, "unhandled update");
            })
            .build();

        let listener = update_listeners::polling_default(self.bot.clone()).await;
        let error_handler =
            LoggingErrorHandler::with_custom_text("Telegram update listener error");

        let shutdown_token = dispatcher.shutdown_token();
        let mut dispatcher_future =
            Box::pin(dispatcher.dispatch_with_listener(listener, error_handler));
        let mut dispatcher_finished = false;

        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!(target: "telegram", "텔레그램 디스패처 종료 요청 수신");
                if let Ok(wait) = shutdown_token.shutdown() {
                    wait.await;
                }
            }
            _ = &mut dispatcher_future => {
                dispatcher_finished = true;
                tracing::info!(target: "telegram", "텔레그램 디스패처 종료 완료");
            }
        }

        if !dispatcher_finished {
            dispatcher_future.await;
        }

        Ok(())
    }

    async fn on_shared_message(bot: Bot, msg: Message, state: Arc<AppState>) -> BotResult<()> {
        if !msg.chat.is_private() {
            return Ok(());
        }
        if !Self::check_access(&bot, &msg, &state).await? {
            return Ok(());
        }

        let text = msg
            .text()
            .or_else(|| msg.caption())
            .map(str::trim)
            .unwrap_or_default();
        let urls = extract_urls(text);
        if urls.is_empty() {
            bot.send_message(
                msg.chat.id,
                "공유할 링크를 보내주세요. Instagram, 네이버 블로그, YouTube 링크를 지원합니다.",
            )
            .await?;
            return Ok(());
        }

        let title = extract_title(text);
        let mut lines = Vec::with_capacity(urls.len());
        for url in &urls {
            match state.controller.add_url(url, title.clone()).await {
                Ok(item) => lines.push(format!("추가됨 [{}] {}", short_id(&item.id), item.url)),
                Err(err) => lines.push(format!("추가 실패: {url}\n  {}", describe_error(&err))),
            }
        }
        let snapshot = state.controller.snapshot();
        lines.push(format!(
            "\n대기열 {}개 · 처리 가능 {}개",
            snapshot.total, snapshot.processable
        ));

        bot.send_message(msg.chat.id, lines.join("\n")).await?;
        Ok(())
    }

    async fn on_command(
        bot: Bot,
        msg: Message,
        cmd: QueueCommand,
        state: Arc<AppState>,
    ) -> BotResult<()> {
        if !matches!(cmd, QueueCommand::Start | QueueCommand::Help)
            && !Self::check_access(&bot, &msg, &state).await?
        {
            return Ok(());
        }
        let controller = &state.controller;

        match cmd {
            QueueCommand::Start => {
                bot.send_message(
                    msg.chat.id,
                    "안녕하세요! 링크를 공유하면 장소를 찾아 드립니다.\n\
                     Instagram, 네이버 블로그, YouTube 링크를 이 채팅으로 보내주세요.",
                )
                .await?;
            }
            QueueCommand::Help => {
                bot.send_message(msg.chat.id, QueueCommand::descriptions().to_string())
                    .await?;
            }
            QueueCommand::Queue => {
                let items = controller.items();
                let text = if items.is_empty() {
                    "대기열이 비어 있습니다.".to_string()
                } else {
                    let tz = state.config.display_timezone();
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| format_item_line(index, item, tz))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                };
                bot.send_message(msg.chat.id, text).await?;
            }
            QueueCommand::Status => {
                let mut text = format_snapshot(&controller.snapshot());
                let highlighted = controller.high_confidence_items();
                if !highlighted.is_empty() {
                    text.push_str("\n\n저장 추천 장소:");
                    for item in &highlighted {
                        if let Some(result) = item.result() {
                            text.push_str(&format!(
                                "\n- [{}] {} ({})",
                                short_id(&item.id),
                                result.place_name,
                                result.category
                            ));
                        }
                    }
                }
                if let Some(err) = controller.last_error() {
                    text.push_str(&format!("\n최근 오류: {err}"));
                }
                bot.send_message(msg.chat.id, text).await?;
            }
            QueueCommand::Process => {
                Self::start_batch(&bot, &msg, &state, BatchKind::Process).await?;
            }
            QueueCommand::Retry => {
                Self::start_batch(&bot, &msg, &state, BatchKind::Retry).await?;
            }
            QueueCommand::Save(needle) => {
                let Some(id) = Self::lookup(&bot, &msg, &state, &needle).await? else {
                    return Ok(());
                };
                let place_name = controller
                    .item(&id)
                    .and_then(|item| item.result().map(|result| result.place_name.clone()));
                let reply = match controller.save_item(&id).await {
                    Ok(place_id) => format!(
                        "'{}' 장소를 저장했습니다. (place id: {place_id})",
                        place_name.as_deref().unwrap_or("분석된 장소")
                    ),
                    Err(err) => describe_error(&err),
                };
                bot.send_message(msg.chat.id, reply).await?;
            }
            QueueCommand::Ignore(needle) => {
                let Some(id) = Self::lookup(&bot, &msg, &state, &needle).await? else {
                    return Ok(());
                };
                let reply = match controller.ignore_item(&id).await {
                    Ok(()) => format!("[{}] 항목을 무시했습니다.", short_id(&id)),
                    Err(err) => describe_error(&err),
                };
                bot.send_message(msg.chat.id, reply).await?;
            }
            QueueCommand::Remove(needle) => {
                let Some(id) = Self::lookup(&bot, &msg, &state, &needle).await? else {
                    return Ok(());
                };
                let reply = match controller.remove_item(&id).await {
                    Ok(()) => format!("[{}] 항목을 삭제했습니다.", short_id(&id)),
                    Err(err) => describe_error(&err),
                };
                bot.send_message(msg.chat.id, reply).await?;
            }
            QueueCommand::Clear => {
                controller.clear_queue().await;
                bot.send_message(msg.chat.id, "대기열을 비웠습니다.").await?;
            }
            QueueCommand::Cleanup => {
                let removed = controller.cleanup_completed_items().await;
                bot.send_message(
                    msg.chat.id,
                    format!("저장/무시된 항목 {removed}개를 정리했습니다."),
                )
                .await?;
            }
            QueueCommand::Cancel => {
                if controller.is_processing() {
                    controller.cancel_processing();
                    bot.send_message(
                        msg.chat.id,
                        "현재 항목이 끝나면 분석을 중단합니다.",
                    )
                    .await?;
                } else {
                    bot.send_message(msg.chat.id, "진행 중인 분석이 없습니다.")
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Runs the batch in the background and replies with its summary.
    async fn start_batch(
        bot: &Bot,
        msg: &Message,
        state: &Arc<AppState>,
        kind: BatchKind,
    ) -> BotResult<()> {
        if state.controller.is_processing() {
            bot.send_message(msg.chat.id, "이미 분석이 진행 중입니다.")
                .await?;
            return Ok(());
        }

        bot.send_message(msg.chat.id, "분석을 시작합니다. 완료되면 알려 드릴게요.")
            .await?;

        let bot = bot.clone();
        let chat_id = msg.chat.id;
        let controller = state.controller.clone();
        tokio::spawn(async move {
            let run = match kind {
                BatchKind::Process => controller.process_batch().await,
                BatchKind::Retry => controller.retry_failed().await,
            };
            let text = match run {
                BatchRun::AlreadyRunning => "이미 분석이 진행 중입니다.".to_string(),
                BatchRun::Finished(summary) if summary.total == 0 => {
                    "분석할 항목이 없습니다.".to_string()
                }
                BatchRun::Finished(summary) => format_batch_summary(&summary),
            };
            if let Err(err) = bot.send_message(chat_id, text).await {
                tracing::warn!(
                    target: "telegram",
                    error = %err,
                    chat_id = chat_id.0,
                    "failed to send batch summary"
                );
            }
        });
        Ok(())
    }

    async fn lookup(
        bot: &Bot,
        msg: &Message,
        state: &AppState,
        needle: &str,
    ) -> BotResult<Option<String>> {
        let reply = match resolve_item_id(&state.controller.items(), needle) {
            IdLookup::Found(id) => return Ok(Some(id)),
            IdLookup::Missing if needle.trim().is_empty() => {
                "항목 ID가 필요합니다. /queue 에서 확인하세요.".to_string()
            }
            IdLookup::Missing => "해당 항목을 찾을 수 없습니다.".to_string(),
            IdLookup::Ambiguous(count) => {
                format!("{count}개의 항목과 일치합니다. ID를 더 길게 입력하세요.")
            }
        };
        bot.send_message(msg.chat.id, reply).await?;
        Ok(None)
    }

    async fn check_access(bot: &Bot, msg: &Message, state: &AppState) -> BotResult<bool> {
        let allowed = msg
            .from
            .as_ref()
            .map(|user| state.is_user_allowed(user_to_i64(user)))
            .unwrap_or(false);
        if !allowed {
            tracing::debug!(target: "telegram", chat_id = msg.chat.id.0, "unauthorized user ignored");
            bot.send_message(msg.chat.id, "이 봇을 사용할 권한이 없습니다.")
                .await?;
        }
        Ok(allowed)
    }
}
