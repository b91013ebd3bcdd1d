mod checkpoints;
mod replicator;
mod statements;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use futures_util::StreamExt;
use roach_cdc::checkpoints::{CheckpointSaver, InMemoryCheckpointSaver};
use roach_cdc::eviction::{start_idle_eviction, IdleEvictionConfig};
use roach_cdc::reader::ReaderOptions;
use roach_cdc::server::{WebhookConfig, WebhookServer};
use roach_cdc::{ChangeFeedDispatcher, DispatcherConfig, Subscriber};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::select;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::checkpoints::TableBackedCheckpointSaver;
use crate::replicator::{Replicator, TableJob};
use crate::statements::{callback_url, changefeed_statement, ChangeFeedStyle, TableDescription};
use crate::writer::{CompositeWriter, SqlRowWriter};

#[derive(Parser)]
struct Args {
    /// Source database URL, used for table introspection and change feed creation
    #[clap(long, env = "ROACH_CDC_SOURCE_URL")]
    source_url: Option<String>,

    /// Target database URL
    #[clap(long, env = "ROACH_CDC_TARGET_URL")]
    target_url: String,

    /// Table names provided as a comma delimited string
    #[clap(short, long, value_delimiter = ',', required = true)]
    tables: Vec<String>,

    /// Statement creating the target table (single table only)
    #[clap(long)]
    create_statement: Option<String>,

    /// Insert or upsert statement with named parameters (single table only)
    #[clap(long)]
    insert_statement: Option<String>,

    /// Delete statement with named parameters (single table only)
    #[clap(long)]
    delete_statement: Option<String>,

    /// Delete parameter names bound to the change feed keys, in key order
    #[clap(long, value_delimiter = ',')]
    key_columns: Vec<String>,

    /// Seconds without events, once the first one arrived, before a job completes
    #[clap(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(10..))]
    poll_timeout_seconds: u64,

    /// Payloads written per transaction
    #[clap(long, default_value_t = 256, value_parser = clap::value_parser!(u64).range(1..))]
    chunk_size: u64,

    /// Payloads buffered per subscriber before deliveries are held back
    #[clap(long, default_value_t = roach_cdc::dispatcher::DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// Ignore resolved timestamps older than the last one
    #[clap(long)]
    strict_watermarks: bool,

    /// Webhook listen address
    #[clap(long, default_value = "0.0.0.0")]
    host: String,

    /// Webhook listen port
    #[clap(short, long, default_value_t = roach_cdc::server::DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// Largest accepted webhook body in bytes
    #[clap(long, default_value_t = roach_cdc::server::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Base URL the change feeds post to, defaults to https://localhost:<port>
    #[clap(long)]
    public_url: Option<String>,

    /// Create the change feeds in the source database
    #[clap(long)]
    create_changefeeds: bool,

    #[clap(long, value_enum, default_value_t = ChangeFeedStyle::Simple)]
    changefeed_style: ChangeFeedStyle,

    /// Stable part of the subscriber ids, random if not set
    #[clap(long)]
    run_id: Option<String>,

    /// Drain the buffer of a previous job registered under the same id
    #[clap(long)]
    reattach: bool,

    /// Table keeping reader checkpoints in the target database, in memory if not set
    #[clap(long)]
    checkpoint_table: Option<String>,

    /// Unregister subscribers idle for longer than this many seconds
    #[clap(long)]
    idle_eviction_seconds: Option<u64>,

    /// Seconds between idle eviction sweeps
    #[clap(long, default_value_t = 60)]
    eviction_interval_seconds: u64,
}

impl Args {
    fn validate(&self) -> anyhow::Result<()> {
        let has_statements = self.create_statement.is_some()
            || self.insert_statement.is_some()
            || self.delete_statement.is_some();
        if has_statements && self.tables.len() != 1 {
            bail!("explicit statements require exactly one table");
        }
        if self.insert_statement.is_some() != self.delete_statement.is_some() {
            bail!("insert and delete statements must be given together");
        }
        if self.insert_statement.is_none() && self.source_url.is_none() {
            bail!("a source URL is required to generate statements");
        }
        if self.create_changefeeds && self.source_url.is_none() {
            bail!("a source URL is required to create change feeds");
        }
        Ok(())
    }
}

struct TableStatements {
    insert: String,
    delete: String,
    key_columns: Vec<String>,
}

async fn table_statements(
    args: &Args,
    source: Option<&PgPool>,
    table: &str,
) -> anyhow::Result<TableStatements> {
    if let (Some(insert), Some(delete)) = (&args.insert_statement, &args.delete_statement) {
        return Ok(TableStatements {
            insert: insert.clone(),
            delete: delete.clone(),
            key_columns: args.key_columns.clone(),
        });
    }

    let Some(source) = source else {
        bail!("a source URL is required to generate statements");
    };
    let description = TableDescription::load(source, table).await?;
    let key_columns = if args.key_columns.is_empty() {
        description.key_column_names()
    } else {
        args.key_columns.clone()
    };
    Ok(TableStatements {
        insert: description.upsert_statement(),
        delete: description.delete_statement()?,
        key_columns,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    args.validate()?;

    actix_web::rt::System::new().block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let dispatcher = Arc::new(ChangeFeedDispatcher::new(DispatcherConfig {
        buffer_capacity: args.buffer_capacity,
        strict_watermarks: args.strict_watermarks,
    })?);

    let webhook_config = WebhookConfig {
        host: args.host.clone(),
        port: args.port,
        max_body_bytes: args.max_body_bytes,
    };
    let server = WebhookServer::build(&webhook_config, dispatcher.clone())?;
    let public_url = args
        .public_url
        .clone()
        .unwrap_or_else(|| format!("https://localhost:{}", server.port()));
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server.run_until_stopped());

    let _eviction_handle = args.idle_eviction_seconds.map(|max_idle| {
        start_idle_eviction(
            dispatcher.clone(),
            IdleEvictionConfig {
                interval: Duration::from_secs(args.eviction_interval_seconds),
                max_idle: Duration::from_secs(max_idle),
            },
        )
    });

    let target = PgPoolOptions::new().connect(&args.target_url).await?;
    let source = match &args.source_url {
        Some(url) => Some(PgPoolOptions::new().connect(url).await?),
        None => None,
    };

    let checkpoint_saver: Arc<dyn CheckpointSaver> = match &args.checkpoint_table {
        Some(table) => Arc::new(TableBackedCheckpointSaver::new(target.clone(), table).await?),
        None => Arc::new(InMemoryCheckpointSaver::new()),
    };

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let poll_timeout = Duration::from_secs(args.poll_timeout_seconds);

    let mut jobs = Vec::with_capacity(args.tables.len());
    let mut changefeeds = Vec::with_capacity(args.tables.len());
    for table in &args.tables {
        let statements = table_statements(&args, source.as_ref(), table).await?;

        let upsert_writer = SqlRowWriter::new(target.clone(), &statements.insert);
        if let Some(create) = &args.create_statement {
            upsert_writer.create(create).await?;
        }
        let delete_writer =
            SqlRowWriter::new(target.clone(), &statements.delete).with_assert_updates(false);
        let writer = CompositeWriter::new(Arc::new(upsert_writer), Arc::new(delete_writer))
            .with_key_columns(statements.key_columns);

        let subscriber_id = format!("{table}-{run_id}");
        let url = callback_url(&public_url, &subscriber_id);
        info!(
            table = %table,
            subscriber_id = %subscriber_id,
            "Change feed statement: {}",
            changefeed_statement(args.changefeed_style, table, &url)
        );
        changefeeds.push(changefeed_statement(args.changefeed_style, table, &url));

        jobs.push(TableJob {
            subscriber: Subscriber::new(subscriber_id, poll_timeout)?.with_table_name(table),
            writer: Arc::new(writer),
        });
    }

    let reader_options = ReaderOptions {
        reattach: args.reattach,
        ..Default::default()
    };
    let (mut replicator, mut handles) = Replicator::new(
        dispatcher.clone(),
        jobs,
        checkpoint_saver,
        reader_options,
        args.chunk_size as usize,
    );

    if let (true, Some(source)) = (args.create_changefeeds, &source) {
        for statement in &changefeeds {
            info!("Creating change feed in source database: {statement}");
            sqlx::raw_sql(statement).execute(source).await?;
        }
    }

    let mut result = Ok(());
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            res = handles.next() => match res {
                Some(Ok(written)) => info!(written, "Table drained"),
                Some(Err(err)) => {
                    // Stop the other tables as well.
                    error!(error = %err, "Drain job failed");
                    result = Err(err);
                    break;
                }
                None => {
                    info!("All tables drained");
                    break;
                }
            }
        }
    }

    replicator.stop();
    while let Some(res) = handles.next().await {
        if let Err(err) = res {
            error!(error = %err, "Drain job failed");
            result = Err(err);
        }
    }

    server_handle.stop().await;
    server_task.await??;
    result
}
