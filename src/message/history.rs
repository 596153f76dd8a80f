use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::{Role, ToolResult, UniversalMessage};
use crate::error::{KestrelError, Result};

const INTERRUPTED_OUTPUT: &str = "tool call was interrupted before a result was recorded";

/// Check that every tool message answers a known call, at most once, and that
/// call ids are unique across the history.
pub fn check_tool_references(history: &[UniversalMessage]) -> Result<()> {
    let mut calls: HashSet<&str> = HashSet::new();
    let mut resolved: HashSet<&str> = HashSet::new();

    for (position, message) in history.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    if !calls.insert(call.id.as_str()) {
                        return Err(KestrelError::InvalidHistory(format!(
                            "message {position}: duplicate tool call id '{}'",
                            call.id
                        )));
                    }
                }
            }
            Role::Tool => {
                let id = tool_call_id(message, position)?;
                if !calls.contains(id) {
                    return Err(KestrelError::InvalidHistory(format!(
                        "message {position}: tool result references unknown call '{id}'"
                    )));
                }
                if !resolved.insert(id) {
                    return Err(KestrelError::InvalidHistory(format!(
                        "message {position}: tool call '{id}' already has a result"
                    )));
                }
            }
            Role::System | Role::User => {}
        }
    }
    Ok(())
}

/// Full pre-request check: references are consistent and no call is left
/// without a result when the conversation moves on or ends.
pub fn validate_history(history: &[UniversalMessage]) -> Result<()> {
    check_tool_references(history)?;

    let mut open: Vec<&str> = Vec::new();
    for (position, message) in history.iter().enumerate() {
        match message.role {
            Role::Tool => {
                let id = tool_call_id(message, position)?;
                open.retain(|pending| *pending != id);
            }
            _ => {
                if let Some(pending) = open.first() {
                    return Err(KestrelError::InvalidHistory(format!(
                        "message {position}: tool call '{pending}' has no result"
                    )));
                }
                if message.role == Role::Assistant {
                    open.extend(message.tool_calls.iter().map(|call| call.id.as_str()));
                }
            }
        }
    }
    match open.first() {
        Some(pending) => Err(KestrelError::InvalidHistory(format!(
            "tool call '{pending}' has no result"
        ))),
        None => Ok(()),
    }
}

/// Return a copy of `history` with `result` appended as a tool message.
///
/// Appending a result identical to the one already recorded for the call is a
/// no-op. A different result for an already resolved call is rejected.
pub fn append_tool_result(
    history: &[UniversalMessage],
    result: &ToolResult,
) -> Result<Vec<UniversalMessage>> {
    let known = history
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .flat_map(|message| message.tool_calls.iter())
        .any(|call| call.id == result.tool_call_id);
    if !known {
        return Err(KestrelError::InvalidHistory(format!(
            "tool result references unknown call '{}'",
            result.tool_call_id
        )));
    }

    let candidate = UniversalMessage::tool(result);
    let existing = history.iter().find(|message| {
        message.role == Role::Tool
            && message.tool_call_id.as_deref() == Some(result.tool_call_id.as_str())
    });
    match existing {
        Some(existing) if *existing == candidate => Ok(history.to_vec()),
        Some(_) => Err(KestrelError::InvalidHistory(format!(
            "tool call '{}' already has a different result",
            result.tool_call_id
        ))),
        None => {
            let mut next = history.to_vec();
            next.push(candidate);
            Ok(next)
        }
    }
}

/// Regroup tool results directly after their assistant turn and give every
/// unanswered call a failed placeholder result.
///
/// Only missing results are added. A history with orphan or duplicate tool
/// results fails with [`KestrelError::InvalidHistory`] instead of being
/// repaired.
pub fn close_dangling_tool_calls(history: &[UniversalMessage]) -> Result<Vec<UniversalMessage>> {
    check_tool_references(history)?;

    let results: HashMap<&str, &UniversalMessage> = history
        .iter()
        .filter(|message| message.role == Role::Tool)
        .filter_map(|message| message.tool_call_id.as_deref().map(|id| (id, message)))
        .collect();

    let mut out = Vec::with_capacity(history.len());
    let mut synthesized = 0usize;
    for message in history.iter().filter(|message| message.role != Role::Tool) {
        out.push(message.clone());
        for call in &message.tool_calls {
            match results.get(call.id.as_str()) {
                Some(result) => out.push((*result).clone()),
                None => {
                    synthesized += 1;
                    let placeholder = ToolResult::failure(call, INTERRUPTED_OUTPUT, 0);
                    out.push(UniversalMessage::tool(&placeholder));
                }
            }
        }
    }
    if synthesized > 0 {
        debug!(synthesized, "closed dangling tool calls in prior history");
    }
    Ok(out)
}

fn tool_call_id(message: &UniversalMessage, position: usize) -> Result<&str> {
    message.tool_call_id.as_deref().ok_or_else(|| {
        KestrelError::InvalidHistory(format!("message {position}: tool message without tool_call_id"))
    })
}
