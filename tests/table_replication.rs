use anyhow::Result;
use shardmover::testing;
use shardmover::{Error, MigrationConfig, ShardName, ShardRegistry, TableReplicator};
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
async fn replicates_a_static_table_when_it_drifts() -> Result<()> {
    let (_container, registry, shard_1, shard_2) = two_shards().await?;
    sqlx::raw_sql(
        r#"INSERT INTO "main_plan" ("id", "name", "price_cents")
           VALUES (1, 'basic', 900), (2, 'pro', 1900)"#,
    )
    .execute(registry.pool(&shard_1)?)
    .await?;
    // Stale copy: same ids, one row missing and one price wrong.
    sqlx::raw_sql(r#"INSERT INTO "main_plan" ("id", "name", "price_cents") VALUES (1, 'basic', 500)"#)
        .execute(registry.pool(&shard_2)?)
        .await?;

    let replicator = TableReplicator::new(registry.clone(), MigrationConfig::default());
    assert!(
        replicator
            .table_data_differs("main_plan", &shard_1, &shard_2)
            .await?
    );

    replicator
        .replicate_table("main_plan", &shard_1, &shard_2)
        .await?;
    assert!(
        !replicator
            .table_data_differs("main_plan", &shard_1, &shard_2)
            .await?
    );
    let price: i64 =
        sqlx::query_scalar(r#"SELECT count(*) FROM "main_plan" WHERE "price_cents" = 900"#)
            .fetch_one(registry.pool(&shard_2)?)
            .await?;
    assert_eq!(price, 1);

    // Identical data is left alone on a second pass.
    replicator
        .replicate_table("main_plan", &shard_1, &shard_2)
        .await?;

    Ok(())
}

#[tokio::test]
async fn refuses_non_static_tables() -> Result<()> {
    let (_container, registry, shard_1, shard_2) = two_shards().await?;
    let replicator = TableReplicator::new(registry.clone(), MigrationConfig::default());

    let err = replicator
        .replicate_table("auth_user", &shard_1, &shard_2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));

    Ok(())
}

#[tokio::test]
async fn scrubbing_removes_orphaned_phone_numbers() -> Result<()> {
    let (_container, registry, shard_1, _shard_2) = two_shards().await?;
    sqlx::raw_sql(
        r#"
        INSERT INTO "auth_user" ("id", "username") VALUES (1, 'henry');
        INSERT INTO "main_phonenumber" ("id", "number") VALUES (10, '+15550010'), (11, '+15550011');
        INSERT INTO "main_extendeduser" ("id", "user_id", "phone_number_id") VALUES (1, 1, 10);
        "#,
    )
    .execute(registry.pool(&shard_1)?)
    .await?;

    let replicator = TableReplicator::new(registry.clone(), MigrationConfig::default());
    replicator.scrub_tables(&shard_1).await?;

    let numbers: Vec<i64> = sqlx::query_scalar(r#"SELECT "id" FROM "main_phonenumber" ORDER BY "id""#)
        .fetch_all(registry.pool(&shard_1)?)
        .await?;
    assert_eq!(numbers, vec![10], "only the referenced number survives");

    Ok(())
}
