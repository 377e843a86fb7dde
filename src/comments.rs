//! Discussion threads on markets.
//!
//! Comments are one level of replies deep in practice, but nothing stops a
//! reply to a reply. Deletion is a soft delete by the author or an admin.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::{MarketError, MarketResult};
use crate::ledger::{Comment, LedgerDb};
use crate::models::Principal;

pub const MAX_COMMENT_CHARS: usize = 1000;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentQuery {
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Clone)]
pub struct CommentService {
    ledger: LedgerDb,
}

impl CommentService {
    pub fn new(ledger: LedgerDb) -> Self {
        Self { ledger }
    }

    pub async fn post_comment(
        &self,
        author: &Principal,
        market_id: Uuid,
        content: &str,
        parent_id: Option<Uuid>,
    ) -> MarketResult<Comment> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MarketError::validation("content", "content is required"));
        }
        if content.chars().count() > MAX_COMMENT_CHARS {
            return Err(MarketError::validation(
                "content",
                format!("content must be at most {} characters", MAX_COMMENT_CHARS),
            ));
        }

        let comment = self
            .ledger
            .atomic(|tx| {
                tx.require_market(market_id)?;
                if let Some(parent_id) = parent_id {
                    let parent = tx.get_comment(parent_id)?;
                    match parent {
                        Some(p) if p.market_id == market_id && p.deleted_at.is_none() => {}
                        _ => return Err(MarketError::CommentNotFound),
                    }
                }
                tx.ensure_user(author.user_id, author.email.as_deref(), author.role)?;

                let comment = Comment {
                    id: Uuid::new_v4(),
                    market_id,
                    user_id: author.user_id,
                    content: content.to_string(),
                    parent_id,
                    reply_count: 0,
                    created_at: Utc::now(),
                    deleted_at: None,
                };
                tx.insert_comment(&comment)?;
                Ok(comment)
            })
            .await?;

        info!(comment_id = %comment.id, market_id = %market_id, user_id = %author.user_id, "comment posted");
        Ok(comment)
    }

    pub async fn list_comments(
        &self,
        market_id: Uuid,
        query: &CommentQuery,
    ) -> MarketResult<CommentPage> {
        let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);
        let (comments, total) = self
            .ledger
            .atomic(|tx| {
                tx.require_market(market_id)?;
                tx.list_comments(market_id, query.parent_id, limit, offset)
            })
            .await?;
        Ok(CommentPage {
            comments,
            total,
            limit,
            offset,
        })
    }

    pub async fn delete_comment(&self, principal: &Principal, comment_id: Uuid) -> MarketResult<()> {
        self.ledger
            .atomic(|tx| {
                let comment = tx.get_comment(comment_id)?.ok_or(MarketError::CommentNotFound)?;
                if comment.deleted_at.is_some() {
                    return Err(MarketError::CommentDeleted);
                }
                if comment.user_id != principal.user_id && !principal.is_admin() {
                    return Err(MarketError::NotCommentOwner);
                }
                if !tx.soft_delete_comment(comment_id, Utc::now())? {
                    return Err(MarketError::CommentDeleted);
                }
                Ok(())
            })
            .await?;

        info!(comment_id = %comment_id, deleted_by = %principal.user_id, "comment deleted");
        Ok(())
    }
}
