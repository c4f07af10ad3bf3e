use anyhow::Result;
use shardmover::testing;
use shardmover::{Error, LogicalShardMigrator, MigrationConfig, ShardName, ShardRegistry};
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

    let shard_1 = ShardName::new("shard_1")?;
    let shard_2 = ShardName::new("shard_2")?;
    let registry = ShardRegistry::builder()
        .shard(shard_1.clone(), pool1, testing::dblink_conninfo("shard_1"))
        .shard(shard_2.clone(), pool2, testing::dblink_conninfo("shard_2"))
        .primary(shard_1.clone())
        .build()?;
    Ok((container, registry, shard_1, shard_2))
}

#[tokio::test]
async fn migrates_a_logical_shard_end_to_end() -> Result<()> {
    let (_container, registry, shard_1, shard_2) = two_shards().await?;
    let source_pool = registry.pool(&shard_1)?;

    // Logical shard 5 under the default modulus: users 5 and 2053.
    sqlx::raw_sql(
        r#"
        INSERT INTO "LogicalShard" ("id", "physical_shard_id", "status") VALUES (5, 1, 'OK');
        INSERT INTO "auth_user" ("id", "username") VALUES (5, 'erin'), (2053, 'frank');
        INSERT INTO "main_contact" ("id", "user_id", "phone")
            VALUES (51, 5, '+15550005'), (52, 2053, '+15552053');
        INSERT INTO "main_thread" ("id", "user_id", "members_json")
            VALUES (53, 5, '[[51],[]]');
        INSERT INTO "main_usermessage" ("id", "user_id", "thread_id", "body")
            VALUES (54, 5, 53, 'hello');
        UPDATE "main_thread" SET "latest_message_id" = 54 WHERE "id" = 53;
        "#,
    )
    .execute(source_pool)
    .await?;

    let migrator = LogicalShardMigrator::new(registry.clone(), MigrationConfig::default());
    let report = migrator.migrate_logical_shard(5, &shard_2).await?;
    assert!(report.succeeded);
    assert_eq!(report.user_ids, vec![5, 2053]);
    assert_eq!(report.pre_source, report.post_destination);

    let row = migrator.logical_shard(5).await?.expect("control row");
    assert_eq!(row.physical_shard_id, 2);
    assert_eq!(row.status, shardmover::LogicalShardStatus::Ok);

    let on_destination: i64 =
        sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "id" IN (5, 2053)"#)
            .fetch_one(registry.pool(&shard_2)?)
            .await?;
    assert_eq!(on_destination, 2);
    let left_behind: i64 =
        sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "id" IN (5, 2053)"#)
            .fetch_one(source_pool)
            .await?;
    assert_eq!(left_behind, 0);

    let messages: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_usermessage""#)
        .fetch_one(registry.pool(&shard_2)?)
        .await?;
    assert_eq!(messages, 1);

    // The shard now lives on shard_2; migrating it there again is refused.
    let err = migrator.migrate_logical_shard(5, &shard_2).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));

    Ok(())
}

#[tokio::test]
async fn failed_migration_never_repoints_the_control_row() -> Result<()> {
    let (_container, registry, shard_1, shard_2) = two_shards().await?;

    sqlx::raw_sql(
        r#"
        INSERT INTO "LogicalShard" ("id", "physical_shard_id", "status") VALUES (7, 1, 'OK');
        INSERT INTO "auth_user" ("id", "username") VALUES (7, 'grace');
        INSERT INTO "main_invitation" ("id", "user_id", "owner_id") VALUES (77, 7, 7);
        "#,
    )
    .execute(registry.pool(&shard_1)?)
    .await?;
    // A conflicting invitation no resolver recognizes: the replay must fail
    // and leave everything where it was.
    sqlx::raw_sql(r#"INSERT INTO "main_invitation" ("id", "user_id", "owner_id") VALUES (77, 9, 9)"#)
        .execute(registry.pool(&shard_2)?)
        .await?;

    let migrator = LogicalShardMigrator::new(registry.clone(), MigrationConfig::default());
    let outcome = migrator.migrate_logical_shard(7, &shard_2).await;
    assert!(outcome.is_err());

    let row = migrator.logical_shard(7).await?.expect("control row");
    assert_eq!(row.physical_shard_id, 1, "control row must not move");

    let copied: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "id" = 7"#)
        .fetch_one(registry.pool(&shard_2)?)
        .await?;
    assert_eq!(copied, 0, "no speculative rows survive a failed replay");
    let original: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "auth_user" WHERE "id" = 7"#)
        .fetch_one(registry.pool(&shard_1)?)
        .await?;
    assert_eq!(original, 1);

    Ok(())
}
