//! # Schema-Qualified SQL
//!
//! SQL text for the pg-boss compatible table layout. The schema name is
//! interpolated (Postgres cannot bind identifiers), so every caller passes a
//! schema that already went through [`crate::config::validate_schema_name`].
//! All values are bound parameters.

/// Columns selected into [`crate::messaging::JobInfo`]
const JOB_INFO_COLUMNS: &str = "id::text AS id, name, state::text AS state, data, created_on, \
     started_on, completed_on, retry_count, retry_limit, singleton_key, output";

/// Reclaims active jobs whose start is older than `$1` seconds and returns the count.
///
/// Retryable jobs go back to `retry`; the rest become `failed`.
pub fn reclaim_orphans(schema: &str) -> String {
    format!(
        r#"
        WITH reclaimed AS (
            UPDATE {schema}.job
            SET state = CASE
                    WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state
                    ELSE 'failed'::{schema}.job_state
                END,
                completed_on = now(),
                output = jsonb_build_object('message', $2::text)
            WHERE state = 'active'
                AND started_on < now() - make_interval(secs => $1::int8)
            RETURNING 1
        )
        SELECT count(*)::int8 AS count FROM reclaimed
        "#
    )
}

pub fn queue_stats(schema: &str) -> String {
    format!(
        r#"
        SELECT
            name,
            (count(*) FILTER (
                WHERE state < 'active' AND start_after <= now()
            ))::int8 AS queued_count,
            (count(*) FILTER (WHERE state = 'active'))::int8 AS active_count,
            (count(*) FILTER (WHERE start_after > now()))::int8 AS deferred_count,
            count(*)::int8 AS total_count
        FROM {schema}.job
        WHERE name = ANY($1::text[])
        GROUP BY name
        ORDER BY name
        "#
    )
}

pub fn recent_jobs(schema: &str) -> String {
    format!(
        r#"
        SELECT {JOB_INFO_COLUMNS}
        FROM {schema}.job
        WHERE name = ANY($1::text[])
        ORDER BY created_on DESC
        LIMIT $2 OFFSET $3
        "#
    )
}

pub fn count_jobs(schema: &str) -> String {
    format!("SELECT count(*)::int8 AS count FROM {schema}.job WHERE name = ANY($1::text[])")
}

pub fn schema_exists() -> &'static str {
    "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)"
}

/// Inserts a job using the queue's defaults where the caller gave none.
///
/// Produces no row when the queue is missing or a singleton conflict occurs.
pub fn insert_job(schema: &str) -> String {
    format!(
        r#"
        INSERT INTO {schema}.job (
            id, name, data, priority, start_after, singleton_key,
            retry_limit, retry_delay, retry_backoff, expire_in, policy
        )
        SELECT
            gen_random_uuid(),
            q.name,
            $2::jsonb,
            COALESCE($3::int, 0),
            now() + make_interval(secs => COALESCE($4::int8, 0)),
            $5::text,
            COALESCE($6::int, q.retry_limit, 2),
            COALESCE($7::int, q.retry_delay, 0),
            COALESCE($8::bool, q.retry_backoff, false),
            make_interval(secs => COALESCE($9::int8, q.expire_seconds, {expire})),
            q.policy
        FROM {schema}.queue q
        WHERE q.name = $1
            AND ($5::text IS NULL OR NOT EXISTS (
                SELECT 1 FROM {schema}.job j
                WHERE j.name = $1 AND j.singleton_key = $5::text AND j.state < 'completed'
            ))
        ON CONFLICT DO NOTHING
        RETURNING id::text
        "#,
        expire = crate::constants::client::DEFAULT_EXPIRE_SECONDS
    )
}

/// Inserts the job for one cron fire time using queue defaults.
///
/// A fire time is claimed by its singleton key in any state, so a job that
/// already completed still blocks a late duplicate from another process.
pub fn insert_scheduled_job(schema: &str) -> String {
    format!(
        r#"
        INSERT INTO {schema}.job (
            id, name, data, singleton_key, retry_limit, retry_delay, retry_backoff,
            expire_in, policy
        )
        SELECT
            gen_random_uuid(),
            q.name,
            $2::jsonb,
            $3::text,
            COALESCE(q.retry_limit, 2),
            COALESCE(q.retry_delay, 0),
            COALESCE(q.retry_backoff, false),
            make_interval(secs => COALESCE(q.expire_seconds, {expire})),
            q.policy
        FROM {schema}.queue q
        WHERE q.name = $1
            AND NOT EXISTS (
                SELECT 1 FROM {schema}.job j
                WHERE j.name = $1 AND j.singleton_key = $3::text
            )
        ON CONFLICT DO NOTHING
        RETURNING id::text
        "#,
        expire = crate::constants::client::DEFAULT_EXPIRE_SECONDS
    )
}

/// Serializes cron claims for one queue and fire time until the transaction ends
pub fn lock_schedule_fire() -> &'static str {
    "SELECT pg_advisory_xact_lock(hashtext($1))"
}

pub fn get_queue(schema: &str) -> String {
    format!(
        "SELECT name, retry_limit, retry_delay, expire_seconds, created_on \
         FROM {schema}.queue WHERE name = $1"
    )
}

pub fn create_queue(schema: &str) -> String {
    format!("SELECT {schema}.create_queue($1, $2::json)")
}

pub fn update_queue(schema: &str) -> String {
    format!(
        r#"
        UPDATE {schema}.queue
        SET expire_seconds = COALESCE($2::int, expire_seconds),
            retry_limit = COALESCE($3::int, retry_limit),
            retry_delay = COALESCE($4::int, retry_delay),
            updated_on = now()
        WHERE name = $1
        "#
    )
}

/// Leases up to `$2` jobs from queue `$1`, marking them active.
///
/// `retry_count` increases only for re-attempts, so a delivered job reports
/// the attempts already made.
pub fn fetch_jobs(schema: &str) -> String {
    format!(
        r#"
        WITH next AS (
            SELECT id
            FROM {schema}.job
            WHERE name = $1
                AND state < 'active'
                AND start_after < now()
            ORDER BY priority DESC, created_on, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE {schema}.job j
        SET state = 'active',
            started_on = now(),
            retry_count = CASE
                WHEN j.started_on IS NOT NULL THEN j.retry_count + 1
                ELSE j.retry_count
            END
        FROM next
        WHERE j.name = $1 AND j.id = next.id
        RETURNING j.id::text AS id, j.name, j.data, j.retry_count, j.retry_limit,
            EXTRACT(epoch FROM j.expire_in)::int8 AS expire_in_seconds
        "#
    )
}

pub fn complete_jobs(schema: &str) -> String {
    format!(
        r#"
        UPDATE {schema}.job
        SET state = 'completed',
            completed_on = now(),
            output = $3::jsonb
        WHERE name = $1
            AND id = ANY($2::uuid[])
            AND state = 'active'
        "#
    )
}

/// Fails jobs, scheduling a retry for those with attempts left.
pub fn fail_jobs(schema: &str) -> String {
    format!(
        r#"
        UPDATE {schema}.job
        SET state = CASE
                WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state
                ELSE 'failed'::{schema}.job_state
            END,
            completed_on = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END,
            start_after = CASE
                WHEN retry_count >= retry_limit THEN start_after
                WHEN NOT retry_backoff THEN now() + retry_delay * interval '1'
                ELSE now() + (retry_delay * 2 ^ LEAST(16, retry_count + 1)) * interval '1'
            END,
            output = $3::jsonb
        WHERE name = $1
            AND id = ANY($2::uuid[])
            AND state < 'completed'
        "#
    )
}

pub fn upsert_schedule(schema: &str) -> String {
    format!(
        r#"
        INSERT INTO {schema}.schedule (name, cron, timezone, data, options)
        VALUES ($1, $2, 'UTC', NULL, '{{}}'::jsonb)
        ON CONFLICT (name) DO UPDATE
        SET cron = EXCLUDED.cron,
            timezone = EXCLUDED.timezone,
            updated_on = now()
        "#
    )
}

pub fn list_schedules(schema: &str) -> String {
    format!("SELECT name, cron, data FROM {schema}.schedule ORDER BY name")
}

pub fn find_jobs(schema: &str) -> String {
    format!(
        r#"
        SELECT {JOB_INFO_COLUMNS}
        FROM {schema}.job
        WHERE name = $1
            AND ($2::text IS NULL OR id::text = $2::text)
        ORDER BY created_on DESC
        "#
    )
}
