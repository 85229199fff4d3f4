use teloxide::prelude::*;

use crate::{config::AppConfig, domain::BatchSummary};

/// Sends a message to the configured admin user, logging a warning on failure.
pub async fn notify_admin(bot: &Bot, config: &AppConfig, text: &str) {
    let Some(admin_user_id) = config.admin_user_id else {
        return;
    };
    if admin_user_id == 0 {
        return;
    }
    if let Err(err) = bot.send_message(ChatId(admin_user_id), text).await {
        tracing::warn!(
            target: "telegram",
            error = %err,
            admin_user_id,
            "failed to send admin notification"
        );
    }
}

pub fn format_batch_summary(summary: &BatchSummary) -> String {
    let mut message = format!(
        "분석 완료: {}/{}건 처리\n- 성공: {}\n- 실패: {}",
        summary.processed, summary.total, summary.completed, summary.failed
    );
    if summary.requeued > 0 {
        message.push_str(&format!("\n- 대기열 복귀: {}", summary.requeued));
    }
    if summary.skipped > 0 {
        message.push_str(&format!("\n- 건너뜀: {}", summary.skipped));
    }
    if summary.cancelled {
        message.push_str("\n(사용자 요청으로 중단됨)");
    }
    message
}
