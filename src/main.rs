use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use identity_import::{
    BulkImportService, DatabaseConfig, ImportConfig, ImportOptions, ImportRequest, MapperRegistry,
    PgStore, TableType, TemplateFormat, UploadedFile, ValidationMode, init_logger, templates,
};

#[derive(Parser, Debug)]
#[command(
    name = "identity-import",
    about = "Bulk import users, roles and applications from CSV, Excel, JSON, XML or YAML"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import files into the database named by DATABASE_URL.
    Import {
        /// Target table (`users`, `roles`, `applications`, `user_applications`).
        #[arg(long)]
        table: TableType,

        /// Id of the user performing the import.
        #[arg(long)]
        user: Uuid,

        /// Import valid and repairable rows even when other rows are invalid.
        #[arg(long)]
        ignore_errors: bool,

        /// Rows per commit for row-only tables above the commit threshold.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Validation strategy (`auto`, `sequential`, `batch`, `parallel`).
        #[arg(long, default_value = "auto")]
        mode: ValidationMode,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Write an import template.
    Template {
        #[arg(long)]
        table: TableType,

        /// Template format (`csv`, `json`, `xml`, `yaml`).
        #[arg(long, default_value = "csv")]
        format: TemplateFormat,

        /// Fill the template with example rows.
        #[arg(long)]
        examples: bool,

        /// Write to this path instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let cli = Cli::parse();

    match cli.command {
        Command::Import {
            table,
            user,
            ignore_errors,
            batch_size,
            mode,
            files,
        } => {
            let database = DatabaseConfig::from_env();
            let Some(url) = database.url else {
                writeln!(io::stderr(), "error: DATABASE_URL must be set")?;
                std::process::exit(2);
            };

            let store = PgStore::connect(&url, database.max_connections).await?;
            store.run_migrations().await?;

            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = tokio::fs::read(path).await?;
                uploads.push(UploadedFile::new(path.display().to_string(), bytes));
            }

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received, cancelling import");
                    interrupt.cancel();
                }
            });

            let service = BulkImportService::new(Arc::new(store), ImportConfig::from_env());
            let request = ImportRequest {
                files: uploads,
                table_type: table,
                acting_user: user,
                options: ImportOptions {
                    ignore_errors,
                    batch_size,
                    mode,
                },
            };
            let report = service.import_files(&request, &cancel).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_failures() {
                std::process::exit(1);
            }
        }
        Command::Template {
            table,
            format,
            examples,
            output,
        } => {
            let registry = MapperRegistry::new();
            let mapper = registry.get(table);
            let text = templates::generate(mapper.as_ref(), format, examples)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, text).await?;
                    log::info!("wrote {} template to {}", table, path.display());
                }
                None => print!("{text}"),
            }
        }
    }

    Ok(())
}
