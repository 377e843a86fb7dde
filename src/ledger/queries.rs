//! Read-side listings: the market browser, a user's position history and
//! market discussion threads.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tx::{invalid_column, market_from_row, parse_ts, parse_uuid, LedgerTx};
use crate::errors::MarketResult;
use crate::models::{Market, MarketView, Side};

const MARKET_COLUMNS: &str = "m.id, m.title, m.description, m.deadline, m.arbitrator_type,
    m.arbitrator_email, m.minimum_stake, m.creator_id, m.status, m.outcome, m.pool_for,
    m.pool_against, m.created_at, m.updated_at";

/// Lifecycle filter shared by the market list and the position history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Resolved,
    Cancelled,
}

impl StatusFilter {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Some(StatusFilter::All),
            "active" => Some(StatusFilter::Active),
            "resolved" => Some(StatusFilter::Resolved),
            "cancelled" => Some(StatusFilter::Cancelled),
            _ => None,
        }
    }

    /// Stored `markets.status` value, `None` for no filter.
    fn column_value(&self) -> Option<&'static str> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Active => Some("active"),
            StatusFilter::Resolved => Some("resolved"),
            StatusFilter::Cancelled => Some("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketListFilter {
    pub status: StatusFilter,
    /// Case-insensitive substring of the title or description.
    pub search: Option<String>,
    /// Oldest first instead of newest first.
    pub ascending: bool,
    pub limit: usize,
    pub offset: usize,
}

/// A user's stakes on one side of one market, folded together.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub market: MarketView,
    pub side: Side,
    pub total_amount: f64,
    pub stake_count: i64,
    pub first_staked_at: DateTime<Utc>,
    pub last_staked_at: DateTime<Utc>,
    /// `None` until the market resolves.
    pub won: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionStats {
    pub total_positions: usize,
    pub total_stakes: i64,
    pub active_positions: usize,
    pub resolved_positions: usize,
    pub won_positions: usize,
    pub total_wagered: f64,
    /// Whole percent of resolved positions that won.
    pub win_rate: u32,
}

impl PositionStats {
    pub fn from_summaries(summaries: &[PositionSummary]) -> Self {
        let resolved_positions = summaries.iter().filter(|s| s.won.is_some()).count();
        let won_positions = summaries.iter().filter(|s| s.won == Some(true)).count();
        let win_rate = if resolved_positions > 0 {
            ((won_positions as f64 / resolved_positions as f64) * 100.0).round() as u32
        } else {
            0
        };
        Self {
            total_positions: summaries.len(),
            total_stakes: summaries.iter().map(|s| s.stake_count).sum(),
            active_positions: summaries
                .iter()
                .filter(|s| !s.market.resolved)
                .count(),
            resolved_positions,
            won_positions,
            total_wagered: summaries.iter().map(|s| s.total_amount).sum(),
            win_rate,
        }
    }
}

/// A discussion entry on a market. Deleted comments keep their row with the
/// content blanked so reply threads stay intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub market_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub parent_id: Option<Uuid>,
    pub reply_count: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Escape LIKE wildcards so user input only ever matches literally.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl<'a> LedgerTx<'a> {
    // ===== Market browser =====

    /// One page of markets plus the number of markets matching the filter.
    pub fn list_markets(&self, filter: &MarketListFilter) -> MarketResult<(Vec<Market>, i64)> {
        let status = filter.status.column_value();
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);
        let predicate = "(?1 IS NULL OR m.status = ?1)
            AND (?2 IS NULL OR m.title LIKE ?2 ESCAPE '\\' OR m.description LIKE ?2 ESCAPE '\\')";

        let total: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM markets m WHERE {predicate}"),
            params![status, pattern],
            |row| row.get(0),
        )?;

        let direction = if filter.ascending { "ASC" } else { "DESC" };
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets m WHERE {predicate}
             ORDER BY m.created_at {direction}, m.id {direction}
             LIMIT ?3 OFFSET ?4"
        ))?;
        let markets = stmt
            .query_map(
                params![status, pattern, sql_count(filter.limit), sql_count(filter.offset)],
                market_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((markets, total))
    }

    // ===== Position history =====

    /// Every market/side a user has staked on, most recent first.
    pub fn list_user_positions(
        &self,
        user_id: Uuid,
        status: StatusFilter,
    ) -> MarketResult<Vec<PositionSummary>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MARKET_COLUMNS}, p.side, SUM(p.amount), COUNT(p.id),
                    MIN(p.created_at), MAX(p.created_at)
             FROM positions p JOIN markets m ON m.id = p.market_id
             WHERE p.user_id = ?1 AND (?2 IS NULL OR m.status = ?2)
             GROUP BY p.market_id, p.side
             ORDER BY MAX(p.created_at) DESC, p.market_id, p.side"
        ))?;
        let rows = stmt
            .query_map(
                params![user_id.to_string(), status.column_value()],
                position_summary_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ===== Comments =====

    pub fn insert_comment(&self, comment: &Comment) -> MarketResult<()> {
        let now = comment.created_at.to_rfc3339();
        self.conn().execute(
            "INSERT INTO market_comments
                (id, market_id, user_id, content, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                comment.id.to_string(),
                comment.market_id.to_string(),
                comment.user_id.to_string(),
                comment.content,
                comment.parent_id.map(|id| id.to_string()),
                now,
            ],
        )?;
        Ok(())
    }

    /// Includes deleted comments; callers decide what a tombstone means.
    pub fn get_comment(&self, comment_id: Uuid) -> MarketResult<Option<Comment>> {
        let comment = self
            .conn()
            .query_row(
                "SELECT c.id, c.market_id, c.user_id, c.content, c.parent_id, c.created_at,
                        c.deleted_at,
                        (SELECT COUNT(*) FROM market_comments r
                         WHERE r.parent_id = c.id AND r.deleted_at IS NULL)
                 FROM market_comments c WHERE c.id = ?1",
                params![comment_id.to_string()],
                comment_from_row,
            )
            .optional()?;
        Ok(comment)
    }

    /// Live comments of a market, newest first. Without `parent_id` only
    /// top-level comments are listed; with it, the replies to that comment.
    pub fn list_comments(
        &self,
        market_id: Uuid,
        parent_id: Option<Uuid>,
        limit: usize,
        offset: usize,
    ) -> MarketResult<(Vec<Comment>, i64)> {
        let market = market_id.to_string();
        let parent = parent_id.map(|id| id.to_string());
        let predicate = "c.market_id = ?1 AND c.deleted_at IS NULL
            AND ((?2 IS NULL AND c.parent_id IS NULL) OR c.parent_id = ?2)";

        let total: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM market_comments c WHERE {predicate}"),
            params![market, parent],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT c.id, c.market_id, c.user_id, c.content, c.parent_id, c.created_at,
                    c.deleted_at,
                    (SELECT COUNT(*) FROM market_comments r
                     WHERE r.parent_id = c.id AND r.deleted_at IS NULL)
             FROM market_comments c WHERE {predicate}
             ORDER BY c.created_at DESC, c.id DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let comments = stmt
            .query_map(
                params![market, parent, sql_count(limit), sql_count(offset)],
                comment_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((comments, total))
    }

    /// Blank and tombstone a comment. Returns false if it was already deleted.
    pub fn soft_delete_comment(&self, comment_id: Uuid, at: DateTime<Utc>) -> MarketResult<bool> {
        let ts = at.to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE market_comments SET content = '[deleted]', deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![ts, comment_id.to_string()],
        )?;
        Ok(changed == 1)
    }
}

fn position_summary_from_row(row: &Row<'_>) -> rusqlite::Result<PositionSummary> {
    let market = market_from_row(row)?;
    let side: String = row.get(14)?;
    let side = Side::from_str(&side)
        .ok_or_else(|| invalid_column(14, "unknown side"))?;
    let won = market.state.outcome().map(|outcome| outcome == side);
    Ok(PositionSummary {
        market: market.view(),
        side,
        total_amount: row.get(15)?,
        stake_count: row.get(16)?,
        first_staked_at: parse_ts(17, row.get(17)?)?,
        last_staked_at: parse_ts(18, row.get(18)?)?,
        won,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    let parent_id: Option<String> = row.get(4)?;
    let deleted_at: Option<String> = row.get(6)?;
    Ok(Comment {
        id: parse_uuid(0, row.get(0)?)?,
        market_id: parse_uuid(1, row.get(1)?)?,
        user_id: parse_uuid(2, row.get(2)?)?,
        content: row.get(3)?,
        parent_id: parent_id.map(|id| parse_uuid(4, id)).transpose()?,
        created_at: parse_ts(5, row.get(5)?)?,
        deleted_at: deleted_at.map(|ts| parse_ts(6, ts)).transpose()?,
        reply_count: row.get(7)?,
    })
}
