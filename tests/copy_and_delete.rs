use anyhow::Result;
use shardmover::reflect::SchemaReflector;
use shardmover::testing;
use shardmover::{
    CopyOptions, DeleteOptions, MigrationConfig, ShardName, ShardRegistry, UserDataMover,
};
use sqlx::PgPool;
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

async fn two_shards() -> Result<(
    testcontainers::ContainerAsync<GenericImage>,
    ShardRegistry,
    ShardName,
    ShardName,
)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432).await?;

    let admin = testing::connect_shard(&host, port, "postgres").await?;
    testing::create_shard_database(&admin, "shard_1").await?;
    testing::create_shard_database(&admin, "shard_2").await?;
    let pool1 = testing::connect_shard(&host, port, "shard_1").await?;
    let pool2 = testing::connect_shard(&host, port, "shard_2").await?;
    testing::prepare_shard_schema(&pool1).await?;
    testing::prepare_shard_schema(&pool2).await?;

    let source = ShardName::new("shard_1")?;
    let destination = ShardName::new("shard_2")?;
    let registry = ShardRegistry::builder()
        .shard(source.clone(), pool1, testing::dblink_conninfo("shard_1"))
        .shard(destination.clone(), pool2, testing::dblink_conninfo("shard_2"))
        .primary(source.clone())
        .build()?;
    Ok((container, registry, source, destination))
}

/// Two users with the full product graph: messages in a circular
/// thread/message reference, receipts, link tables, blocks, invitations
/// with a shared group, and pointer-only shortlink/phone/entitlement rows.
async fn seed_users(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        r#"
        INSERT INTO "auth_user" ("id", "username") VALUES (42, 'alice'), (99, 'bob');
        INSERT INTO "main_phonenumber" ("id", "number") VALUES (420, '+15550042'), (990, '+15550099');
        INSERT INTO "main_entitlement" ("id", "credits") VALUES (421, 10), (991, 20);
        INSERT INTO "main_extendeduser"
            ("id", "user_id", "analytics_id", "phone_number_id", "entitlement_id")
            VALUES (42, 42, 'ana-42', 420, 421), (99, 99, 'ana-99', 990, 991);
        INSERT INTO "main_contact" ("id", "user_id", "phone")
            VALUES (4201, 42, '+15550142'), (9901, 99, '+15550199');
        INSERT INTO "main_group" ("id", "user_id", "name")
            VALUES (4202, 42, 'friends'), (9902, 99, 'work');
        INSERT INTO "main_contact_groups" ("id", "contact_id", "group_id")
            VALUES (1, 4201, 4202), (2, 9901, 9902);
        INSERT INTO "main_thread" ("id", "user_id", "members_json")
            VALUES (4203, 42, '[[4201],[]]'), (9903, 99, '[[9901],[]]');
        INSERT INTO "main_shortlink" ("id", "url", "used")
            VALUES (4204, 'https://sh.example/x', now()), (9904, 'https://sh.example/y', NULL);
        INSERT INTO "main_usermessage" ("id", "user_id", "thread_id", "shortlink_id", "body")
            VALUES (4205, 42, 4203, 4204, 'hi'), (9905, 99, 9903, 9904, 'yo');
        UPDATE "main_thread" SET "latest_message_id" = 4205 WHERE "id" = 4203;
        UPDATE "main_thread" SET "latest_message_id" = 9905 WHERE "id" = 9903;
        INSERT INTO "main_receipt"
            ("id", "user_id", "message_id", "contact_id", "group_id", "shortlink_id")
            VALUES (4206, 42, 4205, 4201, NULL, 4204), (9906, 99, 9905, 9901, NULL, NULL);
        INSERT INTO "main_usermessage_contacts" ("id", "usermessage_id", "contact_id")
            VALUES (1, 4205, 4201), (2, 9905, 9901);
        INSERT INTO "main_usermessage_groups" ("id", "usermessage_id", "group_id")
            VALUES (1, 4205, 4202);
        INSERT INTO "main_block" ("id", "user_id", "blocked_user_id", "contact_id", "message_id")
            VALUES (1, 42, 42, 4201, 4205);
        INSERT INTO "main_invitation" ("id", "user_id", "owner_id")
            VALUES (1, 42, 42), (2, 99, 99);
        INSERT INTO "main_groupshare" ("invitation_ptr_id", "group_id") VALUES (1, 4202);
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn seed_plans(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(
        r#"INSERT INTO "main_plan" ("id", "name", "price_cents") VALUES (1, 'basic', 900)"#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[tokio::test]
async fn copy_then_delete_conserves_row_counts() -> Result<()> {
    let (_container, registry, source, destination) = two_shards().await?;
    seed_users(registry.pool(&source)?).await?;
    seed_plans(registry.pool(&source)?).await?;
    seed_plans(registry.pool(&destination)?).await?;

    let reflector = SchemaReflector::new(registry.clone());
    let mover = UserDataMover::new(registry.clone(), reflector, MigrationConfig::default());
    let user_ids = [42i64, 99];

    let pairs = mover.table_pairs(&source).await?;
    let before = mover.table_row_counts(&pairs, &user_ids, &source).await?;
    assert_eq!(before["auth_user"], 2);
    assert_eq!(before["main_usermessage"], 2);

    let held = mover
        .copy_users(&user_ids, &source, &destination, &CopyOptions::default())
        .await?;
    assert!(held.is_none(), "committed copy returns no connection");

    let after_copy = mover
        .table_row_counts(&pairs, &user_ids, &destination)
        .await?;
    assert_eq!(before, after_copy);

    // Pointer-only tables travel through the configured relations.
    let dest_pool = registry.pool(&destination)?;
    let phone_numbers: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_phonenumber""#)
        .fetch_one(dest_pool)
        .await?;
    assert_eq!(phone_numbers, 2);
    let shortlinks: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_shortlink""#)
        .fetch_one(dest_pool)
        .await?;
    assert_eq!(shortlinks, 2);
    let memberships: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_contact_groups""#)
        .fetch_one(dest_pool)
        .await?;
    assert_eq!(memberships, 2);

    mover
        .delete_users(&user_ids, &source, &DeleteOptions::default())
        .await?;
    let after_delete = mover.table_row_counts(&pairs, &user_ids, &source).await?;
    assert!(after_delete.values().all(|&count| count == 0));

    // Static tables are never part of user operations.
    let plans: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_plan""#)
        .fetch_one(registry.pool(&source)?)
        .await?;
    assert_eq!(plans, 1);

    Ok(())
}

#[tokio::test]
async fn copy_rejects_missing_users() -> Result<()> {
    let (_container, registry, source, destination) = two_shards().await?;

    let reflector = SchemaReflector::new(registry.clone());
    let mover = UserDataMover::new(registry.clone(), reflector, MigrationConfig::default());

    let err = mover
        .copy_users(&[12345], &source, &destination, &CopyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, shardmover::Error::Precondition(_)));

    let err = mover
        .copy_users(&[], &source, &destination, &CopyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, shardmover::Error::Precondition(_)));

    Ok(())
}

#[tokio::test]
async fn dump_produces_replayable_sections() -> Result<()> {
    let (_container, registry, source, _destination) = two_shards().await?;
    seed_users(registry.pool(&source)?).await?;

    let reflector = SchemaReflector::new(registry.clone());
    let mover = UserDataMover::new(registry.clone(), reflector, MigrationConfig::default());

    let dump = mover.dump_users(&[42, 99], &source, true).await?;
    let statements = dump.statements();
    assert_eq!(statements.first().map(String::as_str), Some(
        r#"ALTER TABLE "main_contact" DISABLE TRIGGER "main_contact_trigger";"#
    ));
    assert!(statements.iter().any(|s| s == "BEGIN;"));
    assert!(statements.iter().any(|s| s == "COMMIT;"));
    assert!(
        statements
            .iter()
            .any(|s| s.starts_with(r#"INSERT INTO "auth_user""#))
    );

    let sql = dump.to_sql_string(5, 1_700_000_000);
    assert!(sql.starts_with("-- Dump of LogicalShard 5 on 1700000000\n"));
    assert!(sql.contains("-- table = auth_user"));

    let json = dump.to_json_string()?;
    let parsed: Vec<String> = serde_json::from_str(&json)?;
    assert_eq!(parsed.len(), statements.len());

    Ok(())
}
