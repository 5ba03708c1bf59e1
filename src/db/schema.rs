use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL CHECK(provider IN ('gmail', 'outlook')),
            email TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expires_at TEXT,
            latest_history_id TEXT,
            last_synced_at TEXT,
            sync_frequency_minutes INTEGER NOT NULL DEFAULT 15,
            sync_batch_size INTEGER NOT NULL DEFAULT 50,
            sync_enabled BOOLEAN NOT NULL DEFAULT false,
            sync_status TEXT NOT NULL DEFAULT 'idle'
                CHECK(sync_status IN ('idle', 'syncing', 'error', 'requires_reauth')),
            sync_in_progress BOOLEAN NOT NULL DEFAULT false,
            sync_error TEXT,
            last_sync_error_at TEXT,
            watch_resource_id TEXT,
            watch_history_id TEXT,
            watch_expiration TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(user_id, email)
        );

        CREATE TABLE IF NOT EXISTS folders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            connection_id TEXT NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            folder_type TEXT NOT NULL
                CHECK(folder_type IN ('inbox', 'sent', 'drafts', 'archive', 'trash', 'custom')),
            provider_folder_id TEXT NOT NULL,
            UNIQUE(connection_id, folder_type, provider_folder_id)
        );

        CREATE TABLE IF NOT EXISTS cached_messages (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            connection_id TEXT NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            provider_email_id TEXT NOT NULL,
            folder_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
            subject TEXT,
            sender TEXT,
            recipients TEXT,
            cc TEXT,
            date TEXT,
            body_html TEXT,
            body_preview TEXT,
            read BOOLEAN NOT NULL DEFAULT false,
            starred BOOLEAN NOT NULL DEFAULT false,
            attachments TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(user_id, connection_id, provider_email_id)
        );

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            connection_id TEXT NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            provider TEXT NOT NULL CHECK(provider IN ('gmail', 'outlook')),
            sync_type TEXT NOT NULL CHECK(sync_type IN ('full', 'incremental')),
            status TEXT NOT NULL DEFAULT 'in_progress'
                CHECK(status IN ('in_progress', 'completed', 'failed', 'cancelled')),
            priority INTEGER NOT NULL DEFAULT 2,
            progress INTEGER NOT NULL DEFAULT 0,
            folders_completed INTEGER NOT NULL DEFAULT 0,
            total_folders INTEGER NOT NULL DEFAULT 0,
            messages_synced INTEGER NOT NULL DEFAULT 0,
            current_folder TEXT,
            status_message TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            latest_history_id TEXT,
            worker_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_workers (
            worker_id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK(status IN ('active', 'processing', 'inactive', 'error', 'stopped')),
            last_heartbeat TEXT NOT NULL,
            current_job_id TEXT,
            jobs_processed_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_locks (
            id TEXT PRIMARY KEY,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_connections_user_id ON connections(user_id);
        CREATE INDEX IF NOT EXISTS idx_connections_watch_resource
            ON connections(watch_resource_id);
        CREATE INDEX IF NOT EXISTS idx_folders_connection_id ON folders(connection_id);
        CREATE INDEX IF NOT EXISTS idx_messages_connection_folder
            ON cached_messages(connection_id, folder_id);
        CREATE INDEX IF NOT EXISTS idx_messages_provider_email_id
            ON cached_messages(connection_id, provider_email_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_connection_status
            ON sync_jobs(connection_id, status);
        CREATE INDEX IF NOT EXISTS idx_jobs_claimable
            ON sync_jobs(status, worker_id, priority, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_user_created ON sync_jobs(user_id, created_at);
        "#,
    )?;

    Ok(())
}
