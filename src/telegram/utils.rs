use std::convert::TryFrom;

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::types::User;

use crate::{
    domain::{item::MAX_RETRY_COUNT, ItemState, QueueItem, QueueSnapshot},
    tasks::QueueError,
};

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("valid url regex"));

const SHORT_ID_LEN: usize = 8;

pub fn extract_urls(text: &str) -> Vec<String> {
    URL_REGEX
        .find_iter(text)
        .map(|m| normalize_url(m.as_str()))
        .filter(|url| !url.is_empty())
        .collect()
}

/// Share sheets usually send "<title>\n<url>"; whatever text remains once the
/// URLs are removed becomes the item title.
pub fn extract_title(text: &str) -> Option<String> {
    let stripped = URL_REGEX.replace_all(text, " ");
    let title = stripped
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .to_string();
    Some(title)
}

pub fn user_to_i64(user: &User) -> i64 {
    i64::try_from(user.id.0).unwrap_or(i64::MAX)
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

#[derive(Debug, PartialEq, Eq)]
pub enum IdLookup {
    Found(String),
    Missing,
    Ambiguous(usize),
}

/// Resolves a full id or a unique id prefix typed by the user.
pub fn resolve_item_id(items: &[QueueItem], needle: &str) -> IdLookup {
    let needle = needle.trim();
    if needle.is_empty() {
        return IdLookup::Missing;
    }
    let matches: Vec<&QueueItem> = items
        .iter()
        .filter(|item| item.id.starts_with(needle))
        .collect();
    match matches.as_slice() {
        [] => IdLookup::Missing,
        [item] => IdLookup::Found(item.id.clone()),
        many => IdLookup::Ambiguous(many.len()),
    }
}

pub fn format_item_line(index: usize, item: &QueueItem, tz: Tz) -> String {
    let shared = item.shared_at.with_timezone(&tz).format("%m-%d %H:%M");
    let platform = item.platform.map(|p| p.label()).unwrap_or("링크");
    let mut line = format!(
        "{}. [{}] {} · {} · {}",
        index + 1,
        short_id(&item.id),
        status_label(&item.state),
        platform,
        shared
    );
    if let Some(title) = &item.title {
        line.push_str(&format!("\n   {title}"));
    }
    line.push_str(&format!("\n   {}", item.url));
    if let Some(result) = item.result() {
        line.push_str(&format!(
            "\n   → {} ({}, 신뢰도 {:.0}%)",
            result.place_name,
            result.category,
            result.confidence * 100.0
        ));
        if let Some(address) = &result.address {
            line.push_str(&format!("\n   {address}"));
        }
    }
    if let Some(error_message) = item.error_message() {
        line.push_str(&format!(
            "\n   오류: {error_message} (재시도 {}/{MAX_RETRY_COUNT})",
            item.retry_count
        ));
    }
    line
}

pub fn format_snapshot(snapshot: &QueueSnapshot) -> String {
    let mut message = format!(
        "대기열 상태\n- 전체: {}\n- 대기: {}\n- 분석 중: {}\n- 완료: {} (높은 신뢰도 {})\n- 실패: {}\n- 저장: {}\n- 무시: {}\n- 처리 가능: {}",
        snapshot.total,
        snapshot.pending,
        snapshot.analyzing,
        snapshot.completed,
        snapshot.high_confidence,
        snapshot.failed,
        snapshot.saved,
        snapshot.ignored,
        snapshot.processable,
    );
    if snapshot.is_processing {
        message.push_str(&format!(
            "\n분석 진행률: {:.0}%",
            snapshot.progress * 100.0
        ));
    }
    message
}

pub fn describe_error(err: &QueueError) -> String {
    match err {
        QueueError::Validation(_) => {
            "지원하지 않는 링크입니다. (Instagram, 네이버 블로그, YouTube)".to_string()
        }
        QueueError::Duplicate(_) => "이미 대기열에 있는 링크입니다.".to_string(),
        QueueError::Capacity { capacity } => {
            format!("대기열이 가득 찼습니다 (최대 {capacity}개). 정리 후 다시 시도하세요.")
        }
        QueueError::NotFound(_) => "해당 항목을 찾을 수 없습니다.".to_string(),
        QueueError::InvalidState { status, .. } => {
            format!("현재 상태({status})에서는 처리할 수 없습니다.")
        }
        other => format!("오류가 발생했습니다: {other}"),
    }
}

fn status_label(state: &ItemState) -> &'static str {
    match state {
        ItemState::Pending => "대기",
        ItemState::Analyzing => "분석 중",
        ItemState::Completed { .. } => "완료",
        ItemState::Failed { .. } => "실패",
        ItemState::Saved { .. } => "저장됨",
        ItemState::Ignored => "무시됨",
    }
}

fn normalize_url(raw: &str) -> String {
    let mut cleaned = raw.trim_end_matches(char::is_whitespace).to_string();
    while let Some(last) = cleaned.chars().last() {
        let should_trim = match last {
            ')' => !cleaned.contains('('),
            ']' => !cleaned.contains('['),
            '}' => !cleaned.contains('{'),
            '>' => !cleaned.contains('<'),
            '"' => count_char(&cleaned, '"') % 2 == 1,
            '\'' => count_char(&cleaned, '\'') % 2 == 1,
            ',' | '.' | '!' | '?' | ';' => true,
            _ => false,
        };
        if should_trim {
            cleaned.pop();
        } else {
            break;
        }
    }
    cleaned
}

fn count_char(value: &str, needle: char) -> usize {
    value.chars().filter(|ch| *ch == needle).count()
}
