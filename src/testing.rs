//! Shared fixtures for the integration tests: the product schema DDL, a
//! dollar-quote-aware statement splitter, and helpers for carving multiple
//! shard databases out of one Postgres server.

use indoc::indoc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::Result;
use crate::sqlgen::quote_ident;

/// The messaging-product schema every shard carries. Foreign keys are
/// `DEFERRABLE INITIALLY IMMEDIATE` so bulk loads can run under
/// `SET CONSTRAINTS ALL DEFERRED`. `main_thread.latest_message_id` and
/// `main_usermessage.thread_id` form the circular reference the dependency
/// walk has to cope with; `shortlink_id`, `phone_number_id` and
/// `entitlement_id` are deliberate pointer columns with no FK, reachable
/// only through the configured additional relations.
pub const PRODUCT_SCHEMA: &str = indoc! {r#"
    CREATE TABLE "auth_user" (
        "id" bigserial PRIMARY KEY,
        "username" character varying(150) NOT NULL,
        CONSTRAINT "username" UNIQUE ("username")
    );

    CREATE TABLE "main_phonenumber" (
        "id" bigserial PRIMARY KEY,
        "number" character varying(32) NOT NULL
    );

    CREATE TABLE "main_entitlement" (
        "id" bigserial PRIMARY KEY,
        "credits" integer NOT NULL DEFAULT 0
    );

    CREATE TABLE "main_extendeduser" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL REFERENCES "auth_user" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "analytics_id" character varying(64),
        "phone_number_id" bigint,
        "entitlement_id" bigint,
        CONSTRAINT "main_extendeduser_analytics_id_key" UNIQUE ("analytics_id")
    );

    CREATE TABLE "main_contact" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL REFERENCES "auth_user" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "phone" character varying(32) NOT NULL
    );

    CREATE TABLE "main_group" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL REFERENCES "auth_user" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "name" character varying(120) NOT NULL
    );

    CREATE TABLE "main_contact_groups" (
        "id" bigserial PRIMARY KEY,
        "contact_id" bigint NOT NULL REFERENCES "main_contact" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "group_id" bigint NOT NULL REFERENCES "main_group" ("id")
            DEFERRABLE INITIALLY IMMEDIATE
    );

    CREATE TABLE "main_shortlink" (
        "id" bigserial PRIMARY KEY,
        "url" character varying(200) NOT NULL,
        "used" timestamp with time zone
    );

    CREATE TABLE "main_thread" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL REFERENCES "auth_user" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "members_json" text NOT NULL DEFAULT '[[],[]]',
        "latest_message_id" bigint
    );

    CREATE TABLE "main_usermessage" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL REFERENCES "auth_user" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "thread_id" bigint REFERENCES "main_thread" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "shortlink_id" bigint,
        "body" text NOT NULL DEFAULT ''
    );

    ALTER TABLE "main_thread"
        ADD CONSTRAINT "main_thread__latest_message_id_fk"
        FOREIGN KEY ("latest_message_id") REFERENCES "main_usermessage" ("id")
        DEFERRABLE INITIALLY IMMEDIATE;

    CREATE TABLE "main_receipt" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL,
        "message_id" bigint NOT NULL,
        "contact_id" bigint REFERENCES "main_contact" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "group_id" bigint REFERENCES "main_group" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "shortlink_id" bigint,
        CONSTRAINT "main_receipt__message_id_fk"
            FOREIGN KEY ("message_id") REFERENCES "main_usermessage" ("id")
            DEFERRABLE INITIALLY IMMEDIATE
    );

    CREATE TABLE "main_usermessage_contacts" (
        "id" bigserial PRIMARY KEY,
        "usermessage_id" bigint NOT NULL REFERENCES "main_usermessage" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "contact_id" bigint NOT NULL REFERENCES "main_contact" ("id")
            DEFERRABLE INITIALLY IMMEDIATE
    );

    CREATE TABLE "main_usermessage_groups" (
        "id" bigserial PRIMARY KEY,
        "usermessage_id" bigint NOT NULL REFERENCES "main_usermessage" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "group_id" bigint NOT NULL REFERENCES "main_group" ("id")
            DEFERRABLE INITIALLY IMMEDIATE
    );

    CREATE TABLE "main_block" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL,
        "blocked_user_id" bigint NOT NULL,
        "contact_id" bigint NOT NULL REFERENCES "main_contact" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "message_id" bigint NOT NULL REFERENCES "main_usermessage" ("id")
            DEFERRABLE INITIALLY IMMEDIATE
    );

    CREATE TABLE "main_invitation" (
        "id" bigserial PRIMARY KEY,
        "user_id" bigint NOT NULL,
        "owner_id" bigint NOT NULL
    );

    CREATE TABLE "main_groupshare" (
        "invitation_ptr_id" bigint PRIMARY KEY REFERENCES "main_invitation" ("id")
            DEFERRABLE INITIALLY IMMEDIATE,
        "group_id" bigint NOT NULL
    );

    CREATE TABLE "main_plan" (
        "id" bigserial PRIMARY KEY,
        "name" character varying(64) NOT NULL,
        "price_cents" integer NOT NULL
    );

    CREATE TABLE "django_migrations" (
        "id" bigserial PRIMARY KEY,
        "app" character varying(255) NOT NULL,
        "name" character varying(255) NOT NULL
    );

    CREATE TABLE "django_session" (
        "session_key" character varying(40) PRIMARY KEY,
        "session_data" text NOT NULL
    );

    CREATE TABLE "LogicalShard" (
        "id" bigint PRIMARY KEY,
        "physical_shard_id" bigint NOT NULL,
        "status" character varying(16) NOT NULL DEFAULT 'OK'
    );

    CREATE FUNCTION main_contact_touch() RETURNS trigger AS $$
    BEGIN
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql;

    CREATE TRIGGER "main_contact_trigger"
        BEFORE INSERT OR UPDATE ON "main_contact"
        FOR EACH ROW EXECUTE FUNCTION main_contact_touch();
"#};

/// Split a DDL script on semicolons, ignoring semicolons inside `$$ ... $$`
/// blocks.
pub fn split_statements(ddl: &str) -> Vec<String> {
    let mut stmts: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut chars = ddl.chars().peekable();
    let mut in_dollar = false;
    while let Some(ch) = chars.next() {
        if ch == '$' {
            if let Some('$') = chars.peek().copied() {
                in_dollar = !in_dollar;
                buf.push('$');
                buf.push('$');
                chars.next();
                continue;
            }
        }
        if ch == ';' && !in_dollar {
            let stmt = buf.trim();
            if !stmt.is_empty() {
                stmts.push(stmt.to_string());
            }
            buf.clear();
        } else {
            buf.push(ch);
        }
    }
    let tail = buf.trim();
    if !tail.is_empty() {
        stmts.push(tail.to_string());
    }
    stmts
}

/// Apply [`PRODUCT_SCHEMA`] plus the dblink extension to one shard database.
pub async fn prepare_shard_schema(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS dblink")
        .execute(pool)
        .await?;
    for stmt in split_statements(PRODUCT_SCHEMA) {
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

/// Create a shard database on the server behind `admin`.
pub async fn create_shard_database(admin: &PgPool, dbname: &str) -> Result<()> {
    sqlx::query(&format!("CREATE DATABASE {}", quote_ident(dbname)))
        .execute(admin)
        .await?;
    Ok(())
}

/// Client-side pool for one shard database.
pub async fn connect_shard(host: &str, port: u16, dbname: &str) -> Result<PgPool> {
    let url = format!("postgres://postgres:postgres@{host}:{port}/{dbname}?sslmode=disable");
    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    Ok(pool)
}

/// Server-visible conninfo for `dblink()` calls between databases on the
/// same test server. Connections originate inside the container, so the
/// address is always local.
pub fn dblink_conninfo(dbname: &str) -> String {
    format!("host=127.0.0.1 port=5432 dbname={dbname} user=postgres password=postgres")
}
