use std::sync::Arc;

use teloxide::utils::command::BotCommands;

use crate::{config::AppConfig, tasks::QueueController};

pub type BotResult<T> = Result<T, teloxide::RequestError>;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub controller: Arc<QueueController>,
}

impl AppState {
    /// With no admin and no allow-list configured the intake is open to everyone.
    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        if self.config.admin_user_id == Some(user_id) {
            return true;
        }
        if self.config.allowed_user_ids.contains(&user_id) {
            return true;
        }
        self.config.admin_user_id.is_none() && self.config.allowed_user_ids.is_empty()
    }
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "사용 가능한 명령어:")]
pub enum QueueCommand {
    #[command(description = "봇 소개 및 시작")]
    Start,
    #[command(description = "도움말")]
    Help,
    #[command(description = "공유 대기열 목록")]
    Queue,
    #[command(description = "대기열 상태 확인")]
    Status,
    #[command(description = "대기 중인 링크 분석 시작")]
    Process,
    #[command(description = "실패한 링크 재시도")]
    Retry,
    #[command(description = "분석된 장소 저장 (예: /save 1a2b3c4d)")]
    Save(String),
    #[command(description = "항목 무시 (예: /ignore 1a2b3c4d)")]
    Ignore(String),
    #[command(description = "항목 삭제 (예: /remove 1a2b3c4d)")]
    Remove(String),
    #[command(description = "대기열 비우기")]
    Clear,
    #[command(description = "저장/무시된 항목 정리")]
    Cleanup,
    #[command(description = "진행 중인 분석 중단")]
    Cancel,
}
