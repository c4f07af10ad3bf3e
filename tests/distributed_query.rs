use anyhow::Result;
use shardmover::reflect::SchemaReflector;
use shardmover::testing;
use shardmover::{DistributedQueryRewriter, QueryParam, ShardName, ShardRegistry};
use sqlx::Row;
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

    sqlx::raw_sql(
        r#"INSERT INTO "auth_user" ("id", "username")
           VALUES (1, 'u1'), (3, 'u3'), (5, 'u5')"#,
    )
    .execute(&pool1)
    .await?;
    sqlx::raw_sql(r#"INSERT INTO "auth_user" ("id", "username") VALUES (2, 'u2'), (4, 'u4')"#)
        .execute(&pool2)
        .await?;

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
async fn single_target_passes_through_untouched() -> Result<()> {
    let (_container, registry, shard_1, _shard_2) = two_shards().await?;
    let rewriter =
        DistributedQueryRewriter::new(registry.clone(), SchemaReflector::new(registry.clone()));

    let sql = r#"SELECT "username" FROM "auth_user" WHERE "id" = $1"#;
    let params = [QueryParam::Int(3)];
    let rewritten = rewriter
        .distributed_select(sql, &params, false, Some(std::slice::from_ref(&shard_1)))
        .await?;
    assert!(!rewritten.fanned_out);
    assert_eq!(rewritten.sql, sql);
    assert_eq!(rewritten.params, params);

    let rows = rewriter
        .evaluated_distributed_select(sql, &params, false, Some(std::slice::from_ref(&shard_1)))
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<String, _>("username"), "u3");

    Ok(())
}

#[tokio::test]
async fn count_fans_out_and_sums_across_shards() -> Result<()> {
    let (_container, registry, _shard_1, _shard_2) = two_shards().await?;
    let rewriter =
        DistributedQueryRewriter::new(registry.clone(), SchemaReflector::new(registry.clone()));

    let rewritten = rewriter
        .distributed_select(r#"SELECT count("id") FROM "auth_user""#, &[], false, None)
        .await?;
    assert!(rewritten.fanned_out);
    assert!(rewritten.sql.contains("UNION"), "{}", rewritten.sql);
    assert!(rewritten.sql.contains("SUM"), "{}", rewritten.sql);

    let rows = rewriter
        .evaluated_distributed_select(r#"SELECT count("id") FROM "auth_user""#, &[], false, None)
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i64, _>(0), 5);

    Ok(())
}

#[tokio::test]
async fn shard_tagging_groups_counts_per_shard() -> Result<()> {
    let (_container, registry, _shard_1, _shard_2) = two_shards().await?;
    let rewriter =
        DistributedQueryRewriter::new(registry.clone(), SchemaReflector::new(registry.clone()));

    let rows = rewriter
        .evaluated_distributed_select(r#"SELECT count("id") FROM "auth_user""#, &[], true, None)
        .await?;
    assert_eq!(rows.len(), 2);

    let mut by_shard: Vec<(String, i64)> = rows
        .iter()
        .map(|row| (row.get::<String, _>("shard"), row.get::<i64, _>(0)))
        .collect();
    by_shard.sort();
    assert_eq!(
        by_shard,
        vec![("shard_1".to_string(), 3), ("shard_2".to_string(), 2)]
    );

    Ok(())
}

#[tokio::test]
async fn parameters_travel_into_the_fanned_query() -> Result<()> {
    let (_container, registry, _shard_1, _shard_2) = two_shards().await?;
    let rewriter =
        DistributedQueryRewriter::new(registry.clone(), SchemaReflector::new(registry.clone()));

    let rows = rewriter
        .evaluated_distributed_select(
            r#"SELECT "username" FROM "auth_user" WHERE "id" < $1 ORDER BY "username""#,
            &[QueryParam::Int(3)],
            false,
            None,
        )
        .await?;
    let mut names: Vec<String> = rows.iter().map(|r| r.get("username")).collect();
    names.sort();
    assert_eq!(names, vec!["u1".to_string(), "u2".to_string()]);

    Ok(())
}

#[tokio::test]
async fn multi_shard_exec_reaches_every_shard() -> Result<()> {
    let (_container, registry, shard_1, shard_2) = two_shards().await?;
    let rewriter =
        DistributedQueryRewriter::new(registry.clone(), SchemaReflector::new(registry.clone()));

    rewriter
        .multi_shard_exec(r#"INSERT INTO "main_plan" ("id", "name", "price_cents") VALUES (7, 'pro', 1900)"#)
        .await?;
    for shard in [&shard_1, &shard_2] {
        let count: i64 = sqlx::query_scalar(r#"SELECT count(*) FROM "main_plan""#)
            .fetch_one(registry.pool(shard)?)
            .await?;
        assert_eq!(count, 1);
    }

    Ok(())
}
