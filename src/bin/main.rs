use std::sync::Arc;

use acme_dns_renewal::*;

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Read settings from file
    #[arg(
        short = 'c',
        long,
        value_name = "SETTINGS FILE",
        default_value = "acme-renewal.toml"
    )]
    settings_file: std::path::PathBuf,

    #[command(subcommand)]
    command: CliCommands,
}

#[derive(clap::Subcommand)]
enum CliCommands {
    /// Create the renewal config and its Let's Encrypt account
    Register {
        #[arg(long, default_value = "default")]
        name: String,

        /// Contact email address of the account
        #[arg(long)]
        email: String,

        /// Domain sentinel records are created under
        #[arg(long)]
        propagation_domain: String,

        /// Use the Let's Encrypt staging endpoint
        #[arg(long)]
        staging: bool,

        /// ACME directory of another CA
        #[arg(long, value_parser = url::Url::parse)]
        directory_url: Option<url::Url>,
    },
    /// Manage a domain and request its first certificate
    Manage { domain: String },
    /// Renew expiring certificates once
    Scan {},
    /// Scan daily and keep renewing
    Run {},
    /// List managed certificates
    Status {},
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    use clap::Parser;

    let cli = Cli::parse();
    let settings = Settings::from_file(&cli.settings_file)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::open(settings.store_file())?);

    match cli.command {
        CliCommands::Register {
            name,
            email,
            propagation_domain,
            staging,
            directory_url,
        } => {
            let mut config = RenewalConfig::new(&name, &email, &propagation_domain, staging);
            config.directory_url = directory_url.map(String::from);
            let config = register_config(store.as_ref(), &InstantAcmeConnector, config).await?;
            println!("Registered {} ({})", config.name, config.directory_url());
        }
        CliCommands::Manage { domain } => {
            let (workflow, runner) = build(store, &settings)?;
            let certificate = workflow.manage_domain(&domain)?;
            println!("Managing {} as {}", domain, certificate.id);
            runner.run_until_idle().await;
        }
        CliCommands::Scan {} => {
            let (workflow, runner) = build(store, &settings)?;
            workflow.run(Step::Scan).await;
            runner.run_until_idle().await;
        }
        CliCommands::Run {} => {
            let (_workflow, runner) = build(store, &settings)?;
            runner.run().await;
        }
        CliCommands::Status {} => {
            for crt in store.certificates(&CertificateQuery::managed())? {
                let last_failure = crt
                    .last_failure()
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\tnot_after={}\tlast_failure={}",
                    crt.id,
                    crt.primary_domain().unwrap_or("-"),
                    crt.not_after.to_rfc3339(),
                    last_failure
                );
            }
        }
    }

    Ok(())
}

fn build(
    store: Arc<dyn ResourceStore>,
    settings: &Settings,
) -> Result<(Arc<Workflow>, Runner), Error> {
    let (scheduler, steps) = TokioScheduler::new();
    let workflow = Arc::new(Workflow::new(
        store,
        Arc::new(scheduler),
        Arc::new(LogAlertSink),
        Arc::new(SystemResolver::new(settings.nameservers())?),
        Arc::new(InstantAcmeConnector),
        settings.clone(),
    ));
    let runner = Runner::new(workflow.clone(), steps, settings.scan_interval());
    Ok((workflow, runner))
}
