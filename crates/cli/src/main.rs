//! Administrative CLI for Curio.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use curio_catalog::{CatalogStore, CellValue, InputRow, OnExisting, OnMissing, QueryOptions};
use curio_core::config::CatalogConfig;
use curio_core::{DbType, PolicyName, PrincipalContext, TagDef, TagRef, TagValue};
use curio_query::{QueryShape, parse_path};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::io::Read;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "curioctl")]
#[command(about = "Administrative CLI for the Curio metadata catalog")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CURIO_CONFIG", default_value = "config/curio.toml")]
    config: String,

    #[command(flatten)]
    principal: PrincipalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct PrincipalArgs {
    /// Act as this principal (default: anonymous)
    #[arg(long = "as", value_name = "PRINCIPAL")]
    principal: Option<String>,

    /// Attribute/role held by the principal (repeatable)
    #[arg(long = "attr", value_name = "ATTRIBUTE")]
    attributes: Vec<String>,

    /// Act with superuser rights (bypasses policy checks)
    #[arg(long)]
    superuser: bool,
}

impl PrincipalArgs {
    fn context(&self) -> PrincipalContext {
        let mut ctx = match &self.principal {
            Some(p) => PrincipalContext::authenticated(p.clone(), self.attributes.clone()),
            None => PrincipalContext::anonymous(),
        };
        ctx.superuser = self.superuser;
        ctx
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Tag definition commands
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// View definition commands
    View {
        #[command(subcommand)]
        command: ViewCommands,
    },
    /// Subject lifecycle commands
    Subject {
        #[command(subcommand)]
        command: SubjectCommands,
    },
    /// Read one subject's triples for a tag
    Get { subject: i64, tag: String },
    /// Set one triple
    Set {
        subject: i64,
        tag: String,
        value: Option<String>,
    },
    /// Delete triples of a tag (all values unless one is given)
    Unset {
        subject: i64,
        tag: String,
        value: Option<String>,
    },
    /// Run a query path
    Query {
        path: String,
        /// Response shape: triples, values, count, topvals, botvals
        #[arg(long, default_value = "triples")]
        shape: String,
        /// Value limit for topvals/botvals
        #[arg(long, default_value_t = 10)]
        top: u32,
        /// Row limit for triples queries
        #[arg(long)]
        limit: Option<u64>,
        /// Named view expanding the default projection
        #[arg(long)]
        view: Option<String>,
    },
    /// Bulk-update subjects along a path from a JSON row array
    Update {
        path: String,
        /// JSON input file ("-" for stdin)
        #[arg(long, default_value = "-")]
        input: String,
        #[arg(long, default_value = "create")]
        on_missing: String,
        #[arg(long, default_value = "merge")]
        on_existing: String,
    },
    /// Delete every subject a path matches
    DeleteSubjects { path: String },
    /// Delete tags from every subject a path matches
    DeleteTags {
        path: String,
        /// Tag to delete (repeatable)
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
    /// Check catalog connectivity
    Health,
}

#[derive(Subcommand)]
enum TagCommands {
    /// Define a new tag
    Define {
        name: String,
        #[arg(long, default_value = "text")]
        dbtype: String,
        #[arg(long)]
        multivalue: bool,
        #[arg(long)]
        unique: bool,
        /// Unique tag this tag's values must reference
        #[arg(long)]
        tagref: Option<String>,
        /// Make the reference soft (no integrity enforcement)
        #[arg(long)]
        soft: bool,
        #[arg(long, default_value = "anonymous")]
        readpolicy: String,
        #[arg(long, default_value = "subject")]
        writepolicy: String,
    },
    /// Undefine a tag and drop its data
    Drop { name: String },
    /// List defined tags
    List,
}

#[derive(Subcommand)]
enum ViewCommands {
    /// Define a named view
    Define {
        name: String,
        /// Tag the view projects (repeatable)
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
}

#[derive(Subcommand)]
enum SubjectCommands {
    /// Create a subject owned by the acting principal
    Create,
    /// Delete a subject
    Delete { id: i64 },
}

fn load_config(path: &str) -> Result<CatalogConfig> {
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("CURIO_").split("__"))
        .extract()
        .with_context(|| format!("loading configuration from {path}"))
}

fn parse_shape(shape: &str, top: u32) -> Result<QueryShape> {
    match shape {
        "triples" => Ok(QueryShape::Triples),
        "values" => Ok(QueryShape::Values),
        "count" => Ok(QueryShape::Count),
        "topvals" => Ok(QueryShape::TopVals {
            limit: top,
            bottom: false,
        }),
        "botvals" => Ok(QueryShape::TopVals {
            limit: top,
            bottom: true,
        }),
        other => anyhow::bail!("unknown shape: {other}"),
    }
}

fn cell_to_json(cell: Option<&CellValue>) -> serde_json::Value {
    match cell {
        None => serde_json::Value::Null,
        Some(CellValue::Value(v)) => value_to_json(v),
        Some(CellValue::Values(vs)) => {
            serde_json::Value::Array(vs.iter().map(value_to_json).collect())
        }
    }
}

fn value_to_json(v: &TagValue) -> serde_json::Value {
    match v {
        TagValue::Boolean(b) => serde_json::Value::Bool(*b),
        TagValue::Int8(i) => serde_json::Value::from(*i),
        TagValue::Float8(f) => serde_json::Value::from(*f),
        _ => serde_json::Value::String(v.render()),
    }
}

fn read_input_rows(input: &str) -> Result<Vec<InputRow>> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading rows from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading rows from {input}"))?
    };

    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(&text).context("parsing input rows as a JSON array of objects")?;

    Ok(rows
        .into_iter()
        .map(|obj| {
            obj.into_iter()
                .map(|(tag, value)| {
                    let raw = match value {
                        serde_json::Value::Null => None,
                        serde_json::Value::String(s) => Some(s),
                        other => Some(other.to_string()),
                    };
                    (tag, raw)
                })
                .collect()
        })
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("curio=info,curioctl=info")
        }))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let ctx = cli.principal.context();
    let store = CatalogStore::from_config(&config)
        .await
        .context("connecting to the catalog database")?;

    match cli.command {
        Commands::Tag { command } => match command {
            TagCommands::Define {
                name,
                dbtype,
                multivalue,
                unique,
                tagref,
                soft,
                readpolicy,
                writepolicy,
            } => {
                let mut td = TagDef::new(name.clone(), DbType::parse(&dbtype)?);
                td.multivalue = multivalue;
                td.unique = unique;
                td.readpolicy = PolicyName::parse(&readpolicy)?;
                td.writepolicy = PolicyName::parse(&writepolicy)?;
                td.tagref = tagref.map(|target| {
                    if soft {
                        TagRef::soft(target)
                    } else {
                        TagRef::hard(target)
                    }
                });
                store.define_tag(&ctx, &td).await?;
                println!("tag '{name}' defined");
            }
            TagCommands::Drop { name } => {
                store.undefine_tag(&ctx, &name).await?;
                println!("tag '{name}' dropped");
            }
            TagCommands::List => {
                let rows = store
                    .query(
                        &ctx,
                        "tagdef(tagdef;tagdef-dbtype;tagdef-multivalue;tagdef-unique;tagdef-tagref)tagdef:asc:",
                        &QueryOptions::default(),
                    )
                    .await?;
                for row in rows {
                    let mut obj = serde_json::Map::new();
                    for (name, cell) in row.columns() {
                        obj.insert(name.clone(), cell_to_json(cell.as_ref()));
                    }
                    println!("{}", serde_json::Value::Object(obj));
                }
            }
        },
        Commands::View { command } => match command {
            ViewCommands::Define { name, tags } => {
                store.define_view(&ctx, &name, &tags).await?;
                println!("view '{name}' defined");
            }
        },
        Commands::Subject { command } => match command {
            SubjectCommands::Create => {
                let id = store.create_subject(&ctx).await?;
                println!("{id}");
            }
            SubjectCommands::Delete { id } => {
                store.delete_subject(&ctx, id).await?;
                println!("subject {id} deleted");
            }
        },
        Commands::Get { subject, tag } => {
            let values = store.get_triples(&ctx, subject, &tag).await?;
            for value in values {
                match value {
                    Some(v) => println!("{}", v.render()),
                    None => println!("true"),
                }
            }
        }
        Commands::Set {
            subject,
            tag,
            value,
        } => {
            let parsed = match value {
                Some(raw) => Some(parse_tag_value(&store, &ctx, &tag, &raw).await?),
                None => None,
            };
            let changed = store.set_triple(&ctx, subject, &tag, parsed.as_ref()).await?;
            println!("{}", if changed { "set" } else { "unchanged" });
        }
        Commands::Unset {
            subject,
            tag,
            value,
        } => {
            let parsed = match value {
                Some(raw) => Some(parse_tag_value(&store, &ctx, &tag, &raw).await?),
                None => None,
            };
            let deleted = store
                .delete_triple(&ctx, subject, &tag, parsed.as_ref())
                .await?;
            println!("{deleted} triples deleted");
        }
        Commands::Query {
            path,
            shape,
            top,
            limit,
            view,
        } => {
            let options = QueryOptions {
                shape: parse_shape(&shape, top)?,
                view,
                row_limit: limit,
            };
            let rows = store.query(&ctx, &path, &options).await?;
            for row in rows {
                let mut obj = serde_json::Map::new();
                for (name, cell) in row.columns() {
                    obj.insert(name.clone(), cell_to_json(cell.as_ref()));
                }
                println!("{}", serde_json::Value::Object(obj));
            }
        }
        Commands::Update {
            path,
            input,
            on_missing,
            on_existing,
        } => {
            let path = parse_path(&path).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let rows = read_input_rows(&input)?;
            let outcome = store
                .bulk_update(
                    &ctx,
                    &path,
                    &rows,
                    OnMissing::parse(&on_missing)?,
                    OnExisting::parse(&on_existing)?,
                )
                .await?;
            println!(
                "{}",
                serde_json::json!({ "created": outcome.created, "updated": outcome.updated })
            );
        }
        Commands::DeleteSubjects { path } => {
            let path = parse_path(&path).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let deleted = store.bulk_delete_subjects(&ctx, &path).await?;
            println!("{deleted} subjects deleted");
        }
        Commands::DeleteTags { path, tags } => {
            let path = parse_path(&path).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let deleted = store.bulk_delete_tags(&ctx, &path, &tags).await?;
            println!("{deleted} triples deleted");
        }
        Commands::Health => {
            store.health_check().await?;
            println!("ok");
        }
    }

    Ok(())
}

/// Parse a raw CLI value against the tag's declared dbtype.
async fn parse_tag_value(
    store: &CatalogStore,
    ctx: &PrincipalContext,
    tag: &str,
    raw: &str,
) -> Result<TagValue> {
    let rows = store
        .query(
            ctx,
            &format!("tagdef={}(tagdef-dbtype)", curio_query::parse::encode_payload(tag)),
            &QueryOptions::default(),
        )
        .await?;
    let dbtype = rows
        .first()
        .and_then(|r| r.get("tagdef-dbtype"))
        .and_then(|c| c.as_value())
        .and_then(|v| v.as_text().map(str::to_string))
        .ok_or_else(|| anyhow::anyhow!("tag '{tag}' is not defined"))?;
    Ok(TagValue::parse(DbType::parse(&dbtype)?, raw)?)
}
