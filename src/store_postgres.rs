use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::store::{DeliveryApplied, RecipientStore, RetryUpdate};
use crate::types::{
    Campaign, CampaignId, CampaignStatus, DeliveryEvent, DeliveryEventKind, ProviderMessageId,
    Recipient, RecipientId, RecipientStatus,
};

/// Postgres-backed recipient store.
///
/// Every status write is a conditional `UPDATE` whose `WHERE` clause
/// encodes the expected prior state, so concurrent dispatchers, retry
/// passes and webhook processors cannot clobber each other even across
/// processes.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Bootstrap the schema and wrap the client.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS campaigns (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    template_name TEXT NOT NULL,
                    language TEXT NOT NULL DEFAULT 'en',
                    status TEXT NOT NULL,
                    total_recipients INT NOT NULL DEFAULT 0,
                    sent_count INT NOT NULL DEFAULT 0,
                    failed_count INT NOT NULL DEFAULT 0,
                    restart_count INT NOT NULL DEFAULT 0,
                    dispatch_token TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    started_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS recipients (
                    id TEXT PRIMARY KEY,
                    campaign_id TEXT NOT NULL,
                    phone_number TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error_message TEXT,
                    retry_count INT NOT NULL DEFAULT 0,
                    last_retry_at TIMESTAMPTZ,
                    next_retry_at TIMESTAMPTZ,
                    retry_reason TEXT,
                    message_id TEXT,
                    sent_at TIMESTAMPTZ,
                    delivered_at TIMESTAMPTZ,
                    read_at TIMESTAMPTZ,
                    failed_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_recipients_campaign_status
                    ON recipients (campaign_id, status);
                CREATE INDEX IF NOT EXISTS idx_recipients_message_id
                    ON recipients (message_id);",
            )
            .await?;
        Ok(Self { client })
    }
}

fn db_err(err: tokio_postgres::Error) -> StoreError {
    StoreError::new(format!("postgres: {}", err))
}

fn campaign_status_from_str(raw: &str) -> Result<CampaignStatus, StoreError> {
    match raw {
        "draft" => Ok(CampaignStatus::Draft),
        "dispatching" => Ok(CampaignStatus::Dispatching),
        "completed" => Ok(CampaignStatus::Completed),
        "failed" => Ok(CampaignStatus::Failed),
        other => Err(StoreError::new(format!("unknown campaign status: {}", other))),
    }
}

fn recipient_status_from_str(raw: &str) -> Result<RecipientStatus, StoreError> {
    match raw {
        "pending" => Ok(RecipientStatus::Pending),
        "sent" => Ok(RecipientStatus::Sent),
        "delivered" => Ok(RecipientStatus::Delivered),
        "read" => Ok(RecipientStatus::Read),
        "failed" => Ok(RecipientStatus::Failed),
        "skipped" => Ok(RecipientStatus::Skipped),
        other => Err(StoreError::new(format!(
            "unknown recipient status: {}",
            other
        ))),
    }
}

fn row_to_campaign(row: &Row) -> Result<Campaign, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Campaign {
        id: CampaignId(row.try_get("id").map_err(db_err)?),
        name: row.try_get("name").map_err(db_err)?,
        template_name: row.try_get("template_name").map_err(db_err)?,
        language: row.try_get("language").map_err(db_err)?,
        status: campaign_status_from_str(&status)?,
        total_recipients: row.try_get::<_, i32>("total_recipients").map_err(db_err)? as u32,
        sent_count: row.try_get::<_, i32>("sent_count").map_err(db_err)? as u32,
        failed_count: row.try_get::<_, i32>("failed_count").map_err(db_err)? as u32,
        restart_count: row.try_get::<_, i32>("restart_count").map_err(db_err)? as u32,
        created_at: row.try_get("created_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_recipient(row: &Row) -> Result<Recipient, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let message_id: Option<String> = row.try_get("message_id").map_err(db_err)?;
    Ok(Recipient {
        id: RecipientId(row.try_get("id").map_err(db_err)?),
        campaign_id: CampaignId(row.try_get("campaign_id").map_err(db_err)?),
        phone_number: row.try_get("phone_number").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        status: recipient_status_from_str(&status)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        retry_count: row.try_get::<_, i32>("retry_count").map_err(db_err)? as u32,
        last_retry_at: row.try_get("last_retry_at").map_err(db_err)?,
        next_retry_at: row.try_get("next_retry_at").map_err(db_err)?,
        retry_reason: row.try_get("retry_reason").map_err(db_err)?,
        message_id: message_id.map(ProviderMessageId),
        sent_at: row.try_get("sent_at").map_err(db_err)?,
        delivered_at: row.try_get("delivered_at").map_err(db_err)?,
        read_at: row.try_get("read_at").map_err(db_err)?,
        failed_at: row.try_get("failed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

/// SQL CASE expression mapping a status column to its monotonic rank.
/// Terminal failure states rank 99 so forward events never overwrite them.
const RANK_CASE: &str = "CASE status \
    WHEN 'pending' THEN 0 WHEN 'sent' THEN 1 \
    WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 99 END";

#[async_trait]
impl RecipientStore for PostgresStore {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO campaigns (id, name, template_name, language, status,
                    total_recipients, sent_count, failed_count, restart_count,
                    created_at, started_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &campaign.id.0,
                    &campaign.name,
                    &campaign.template_name,
                    &campaign.language,
                    &campaign.status.as_str(),
                    &(campaign.total_recipients as i32),
                    &(campaign.sent_count as i32),
                    &(campaign.failed_count as i32),
                    &(campaign.restart_count as i32),
                    &campaign.created_at,
                    &campaign.started_at,
                    &campaign.updated_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM campaigns WHERE id = $1", &[&id.0])
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_campaign).transpose()
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM campaigns WHERE status = 'dispatching'", &[])
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_campaign).collect()
    }

    async fn try_acquire_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
    ) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE campaigns
                 SET status = 'dispatching',
                     dispatch_token = $2,
                     started_at = COALESCE(started_at, NOW()),
                     updated_at = NOW()
                 WHERE id = $1 AND status <> 'dispatching'",
                &[&id.0, &token],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn release_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
        into: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE campaigns SET status = $2, dispatch_token = NULL, updated_at = NOW()
                 WHERE id = $1 AND status = 'dispatching' AND dispatch_token = $3",
                &[&id.0, &into.as_str(), &token],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        id: &CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE campaigns SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id.0, &status.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_restart_count(&self, id: &CampaignId) -> Result<u32, StoreError> {
        let row = self
            .client
            .query_one(
                "UPDATE campaigns
                 SET restart_count = restart_count + 1, updated_at = NOW()
                 WHERE id = $1
                 RETURNING restart_count",
                &[&id.0],
            )
            .await
            .map_err(db_err)?;
        Ok(row.try_get::<_, i32>(0).map_err(db_err)? as u32)
    }

    async fn refresh_campaign_counts(&self, id: &CampaignId) -> Result<Campaign, StoreError> {
        let row = self
            .client
            .query_one(
                "UPDATE campaigns c SET
                    total_recipients = (SELECT COUNT(*)::INT FROM recipients r
                        WHERE r.campaign_id = c.id),
                    sent_count = (SELECT COUNT(*)::INT FROM recipients r
                        WHERE r.campaign_id = c.id
                          AND r.status IN ('sent', 'delivered', 'read')),
                    failed_count = (SELECT COUNT(*)::INT FROM recipients r
                        WHERE r.campaign_id = c.id AND r.status = 'failed'),
                    updated_at = NOW()
                 WHERE c.id = $1
                 RETURNING *",
                &[&id.0],
            )
            .await
            .map_err(db_err)?;
        row_to_campaign(&row)
    }

    async fn insert_recipients(&self, recipients: &[Recipient]) -> Result<(), StoreError> {
        for r in recipients {
            self.client
                .execute(
                    "INSERT INTO recipients (id, campaign_id, phone_number, name, status,
                        error_message, retry_count, last_retry_at, next_retry_at,
                        retry_reason, message_id, sent_at, delivered_at, read_at,
                        failed_at, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                        $14, $15, $16, $17)
                     ON CONFLICT (id) DO NOTHING",
                    &[
                        &r.id.0,
                        &r.campaign_id.0,
                        &r.phone_number,
                        &r.name,
                        &r.status.as_str(),
                        &r.error_message,
                        &(r.retry_count as i32),
                        &r.last_retry_at,
                        &r.next_retry_at,
                        &r.retry_reason,
                        &r.message_id.as_ref().map(|m| m.0.clone()),
                        &r.sent_at,
                        &r.delivered_at,
                        &r.read_at,
                        &r.failed_at,
                        &r.created_at,
                        &r.updated_at,
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM recipients WHERE id = $1", &[&id.0])
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_recipient).transpose()
    }

    async fn recipients_by_ids(
        &self,
        ids: &[RecipientId],
    ) -> Result<Vec<Recipient>, StoreError> {
        let raw: Vec<String> = ids.iter().map(|i| i.0.clone()).collect();
        let rows = self
            .client
            .query("SELECT * FROM recipients WHERE id = ANY($1)", &[&raw])
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_recipient).collect()
    }

    async fn pending_recipients(
        &self,
        campaign: &CampaignId,
    ) -> Result<Vec<Recipient>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM recipients
                 WHERE campaign_id = $1 AND status = 'pending'
                 ORDER BY created_at",
                &[&campaign.0],
            )
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_recipient).collect()
    }

    async fn has_pending(&self, campaign: &CampaignId) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM recipients
                    WHERE campaign_id = $1 AND status = 'pending')",
                &[&campaign.0],
            )
            .await
            .map_err(db_err)?;
        row.try_get(0).map_err(db_err)
    }

    async fn failed_recipients(
        &self,
        campaign: Option<&CampaignId>,
        max_retries: u32,
    ) -> Result<Vec<Recipient>, StoreError> {
        let max = max_retries as i32;
        let rows = match campaign {
            Some(c) => self
                .client
                .query(
                    "SELECT * FROM recipients
                     WHERE status = 'failed' AND retry_count < $1 AND campaign_id = $2",
                    &[&max, &c.0],
                )
                .await
                .map_err(db_err)?,
            None => self
                .client
                .query(
                    "SELECT * FROM recipients
                     WHERE status = 'failed' AND retry_count < $1",
                    &[&max],
                )
                .await
                .map_err(db_err)?,
        };
        rows.iter().map(row_to_recipient).collect()
    }

    async fn successful_phones(
        &self,
        campaign: Option<&CampaignId>,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = match campaign {
            Some(c) => self
                .client
                .query(
                    "SELECT DISTINCT phone_number FROM recipients
                     WHERE status IN ('sent', 'delivered', 'read') AND campaign_id = $1",
                    &[&c.0],
                )
                .await
                .map_err(db_err)?,
            None => self
                .client
                .query(
                    "SELECT DISTINCT phone_number FROM recipients
                     WHERE status IN ('sent', 'delivered', 'read')",
                    &[],
                )
                .await
                .map_err(db_err)?,
        };
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(db_err))
            .collect()
    }

    async fn latest_sent_at(
        &self,
        campaign: &CampaignId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT MAX(sent_at) FROM recipients WHERE campaign_id = $1",
                &[&campaign.0],
            )
            .await
            .map_err(db_err)?;
        row.try_get(0).map_err(db_err)
    }

    async fn repair_corrupt_sent(&self, campaign: &CampaignId) -> Result<u32, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE recipients
                 SET status = 'pending', message_id = NULL, updated_at = NOW()
                 WHERE campaign_id = $1 AND status = 'sent' AND sent_at IS NULL",
                &[&campaign.0],
            )
            .await
            .map_err(db_err)?;
        Ok(updated as u32)
    }

    async fn mark_sent(
        &self,
        id: &RecipientId,
        message_id: &ProviderMessageId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE recipients
                 SET status = 'sent', message_id = $2, sent_at = $3,
                     error_message = NULL, updated_at = NOW()
                 WHERE id = $1 AND status = 'pending'",
                &[&id.0, &message_id.0, &sent_at],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn mark_send_failed(&self, id: &RecipientId, error: &str) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE recipients
                 SET status = 'failed', error_message = $2,
                     retry_count = retry_count + 1, failed_at = NOW(), updated_at = NOW()
                 WHERE id = $1 AND status = 'pending'",
                &[&id.0, &error],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn mark_skipped(&self, id: &RecipientId, reason: &str) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE recipients
                 SET status = 'skipped', retry_reason = $2, updated_at = NOW()
                 WHERE id = $1",
                &[&id.0, &reason],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &RecipientId,
        update: &RetryUpdate,
    ) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE recipients
                 SET status = 'pending', retry_count = $2, last_retry_at = $3,
                     next_retry_at = $4, retry_reason = $5, error_message = NULL,
                     updated_at = NOW()
                 WHERE id = $1 AND status = 'failed'",
                &[
                    &id.0,
                    &(update.retry_count as i32),
                    &update.last_retry_at,
                    &update.next_retry_at,
                    &update.retry_reason,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn reset_failed_to_pending(&self, campaign: &CampaignId) -> Result<u32, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE recipients SET status = 'pending', updated_at = NOW()
                 WHERE campaign_id = $1 AND status = 'failed'",
                &[&campaign.0],
            )
            .await
            .map_err(db_err)?;
        Ok(updated as u32)
    }

    async fn apply_delivery_event(
        &self,
        event: &DeliveryEvent,
    ) -> Result<DeliveryApplied, StoreError> {
        let (column, target) = match event.kind {
            DeliveryEventKind::Sent => ("sent_at", "sent"),
            DeliveryEventKind::Delivered => ("delivered_at", "delivered"),
            DeliveryEventKind::Read => ("read_at", "read"),
            DeliveryEventKind::Failed => {
                let updated = self
                    .client
                    .execute(
                        "UPDATE recipients
                         SET status = 'failed', failed_at = $2, error_message = $3,
                             updated_at = NOW()
                         WHERE message_id = $1
                           AND status NOT IN ('read', 'failed', 'skipped')",
                        &[&event.message_id.0, &event.timestamp, &event.condensed_error()],
                    )
                    .await
                    .map_err(db_err)?;
                if updated == 1 {
                    return Ok(DeliveryApplied::Applied);
                }
                return self.event_noop_kind(&event.message_id.0).await;
            }
        };

        // Forward advance, guarded by the monotonic rank of the current
        // status. Terminal failure states rank past every event.
        let advance = format!(
            "UPDATE recipients
             SET status = $2, {column} = $3, updated_at = NOW()
             WHERE message_id = $1
               AND {RANK_CASE} < CASE $2
                    WHEN 'sent' THEN 1 WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 END",
            column = column,
            RANK_CASE = RANK_CASE,
        );
        let updated = self
            .client
            .execute(
                advance.as_str(),
                &[&event.message_id.0, &target, &event.timestamp],
            )
            .await
            .map_err(db_err)?;
        if updated == 1 {
            return Ok(DeliveryApplied::Applied);
        }

        // Duplicate or out-of-order: backfill the timestamp slot only.
        let backfill = format!(
            "UPDATE recipients SET {column} = $2, updated_at = NOW()
             WHERE message_id = $1 AND {column} IS NULL",
            column = column,
        );
        let backfilled = self
            .client
            .execute(backfill.as_str(), &[&event.message_id.0, &event.timestamp])
            .await
            .map_err(db_err)?;
        if backfilled == 1 {
            return Ok(DeliveryApplied::Applied);
        }

        self.event_noop_kind(&event.message_id.0).await
    }
}

impl PostgresStore {
    /// Distinguish "row exists but nothing to change" from "no such row".
    async fn event_noop_kind(&self, message_id: &str) -> Result<DeliveryApplied, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM recipients WHERE message_id = $1)",
                &[&message_id],
            )
            .await
            .map_err(db_err)?;
        let exists: bool = row.try_get(0).map_err(db_err)?;
        if exists {
            Ok(DeliveryApplied::AlreadyCurrent)
        } else {
            Ok(DeliveryApplied::NotFound)
        }
    }
}
