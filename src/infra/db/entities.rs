//! Column mappings for each stored entity.

use sqlx::{Postgres, QueryBuilder};

use super::store::{PgEntity, unknown_column};
use crate::application::repos::RepoError;
use crate::domain::entities::{
    AccountRecord, BlockRecord, DomainPermissionRecord, EmojiRecord, FollowRecord,
    ListEntryRecord, MediaAttachmentRecord, StatusRecord,
};

impl PgEntity for AccountRecord {
    const TABLE: &'static str = "accounts";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "username",
        "domain",
        "uri",
        "url",
        "display_name",
        "note",
        "actor_type",
        "inbox_uri",
        "outbox_uri",
        "followers_uri",
        "featured_collection_uri",
        "avatar_remote_url",
        "avatar_media_attachment_id",
        "header_remote_url",
        "header_media_attachment_id",
        "emoji_ids",
        "language",
        "created_at",
        "updated_at",
        "fetched_at",
        "suspended_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "username" => qb.push_bind(self.username.clone()),
            "domain" => qb.push_bind(self.domain.clone()),
            "uri" => qb.push_bind(self.uri.clone()),
            "url" => qb.push_bind(self.url.clone()),
            "display_name" => qb.push_bind(self.display_name.clone()),
            "note" => qb.push_bind(self.note.clone()),
            "actor_type" => qb.push_bind(self.actor_type),
            "inbox_uri" => qb.push_bind(self.inbox_uri.clone()),
            "outbox_uri" => qb.push_bind(self.outbox_uri.clone()),
            "followers_uri" => qb.push_bind(self.followers_uri.clone()),
            "featured_collection_uri" => qb.push_bind(self.featured_collection_uri.clone()),
            "avatar_remote_url" => qb.push_bind(self.avatar_remote_url.clone()),
            "avatar_media_attachment_id" => qb.push_bind(self.avatar_media_attachment_id),
            "header_remote_url" => qb.push_bind(self.header_remote_url.clone()),
            "header_media_attachment_id" => qb.push_bind(self.header_media_attachment_id),
            "emoji_ids" => qb.push_bind(self.emoji_ids.clone()),
            "language" => qb.push_bind(self.language.clone()),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            "fetched_at" => qb.push_bind(self.fetched_at),
            "suspended_at" => qb.push_bind(self.suspended_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for FollowRecord {
    const TABLE: &'static str = "follows";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "uri",
        "account_id",
        "target_account_id",
        "show_reblogs",
        "notify",
        "created_at",
        "updated_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "uri" => qb.push_bind(self.uri.clone()),
            "account_id" => qb.push_bind(self.account_id),
            "target_account_id" => qb.push_bind(self.target_account_id),
            "show_reblogs" => qb.push_bind(self.show_reblogs),
            "notify" => qb.push_bind(self.notify),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for BlockRecord {
    const TABLE: &'static str = "blocks";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "uri",
        "account_id",
        "target_account_id",
        "created_at",
        "updated_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "uri" => qb.push_bind(self.uri.clone()),
            "account_id" => qb.push_bind(self.account_id),
            "target_account_id" => qb.push_bind(self.target_account_id),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for ListEntryRecord {
    const TABLE: &'static str = "list_entries";
    const COLUMNS: &'static [&'static str] =
        &["id", "list_id", "follow_id", "created_at", "updated_at"];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "list_id" => qb.push_bind(self.list_id),
            "follow_id" => qb.push_bind(self.follow_id),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for EmojiRecord {
    const TABLE: &'static str = "emojis";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "shortcode",
        "domain",
        "uri",
        "image_remote_url",
        "image_url",
        "disabled",
        "created_at",
        "updated_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "shortcode" => qb.push_bind(self.shortcode.clone()),
            "domain" => qb.push_bind(self.domain.clone()),
            "uri" => qb.push_bind(self.uri.clone()),
            "image_remote_url" => qb.push_bind(self.image_remote_url.clone()),
            "image_url" => qb.push_bind(self.image_url.clone()),
            "disabled" => qb.push_bind(self.disabled),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for MediaAttachmentRecord {
    const TABLE: &'static str = "media_attachments";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "account_id",
        "kind",
        "remote_url",
        "url",
        "content_type",
        "size_bytes",
        "created_at",
        "updated_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "account_id" => qb.push_bind(self.account_id),
            "kind" => qb.push_bind(self.kind),
            "remote_url" => qb.push_bind(self.remote_url.clone()),
            "url" => qb.push_bind(self.url.clone()),
            "content_type" => qb.push_bind(self.content_type.clone()),
            "size_bytes" => qb.push_bind(self.size_bytes),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for StatusRecord {
    const TABLE: &'static str = "statuses";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "uri",
        "account_id",
        "boost_of_id",
        "pinned_at",
        "created_at",
        "updated_at",
    ];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "uri" => qb.push_bind(self.uri.clone()),
            "account_id" => qb.push_bind(self.account_id),
            "boost_of_id" => qb.push_bind(self.boost_of_id),
            "pinned_at" => qb.push_bind(self.pinned_at),
            "created_at" => qb.push_bind(self.created_at),
            "updated_at" => qb.push_bind(self.updated_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}

impl PgEntity for DomainPermissionRecord {
    const TABLE: &'static str = "domain_permissions";
    const COLUMNS: &'static [&'static str] = &["id", "kind", "domain", "created_at"];

    fn push_value(
        &self,
        column: &str,
        qb: &mut QueryBuilder<'_, Postgres>,
    ) -> Result<(), RepoError> {
        match column {
            "id" => qb.push_bind(self.id),
            "kind" => qb.push_bind(self.kind),
            "domain" => qb.push_bind(self.domain.clone()),
            "created_at" => qb.push_bind(self.created_at),
            other => return Err(unknown_column::<Self>(other)),
        };
        Ok(())
    }
}
