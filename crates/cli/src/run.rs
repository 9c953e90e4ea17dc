use console::style;
use strom_core::config::ServerOptions;
use tracing_subscriber::EnvFilter;

use crate::Context;

const HOST_VAR: &str = "STROM_HOST";
const PORT_VAR: &str = "STROM_PORT";

#[derive(Debug, thiserror::Error)]
pub enum RunCommandError {
    #[error("Invalid STROM_PORT value '{0}'")]
    InvalidPort(String),
    #[error("Failed to start server: {0}")]
    Server(#[from] strom_core::ServerError),
}

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct RunCommand {
    /// Host to bind to (overrides STROM_HOST and the manifest)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to run the server on (overrides STROM_PORT and the manifest)
    #[arg(long)]
    pub port: Option<u16>,
}

impl RunCommand {
    /// Resolve the bind address: flags win over environment, environment over
    /// the manifest.
    fn server_options<F>(
        &self,
        manifest: &ServerOptions,
        env: F,
    ) -> Result<ServerOptions, RunCommandError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = match &self.host {
            Some(host) => host.clone(),
            None => env(HOST_VAR).unwrap_or_else(|| manifest.host.clone()),
        };

        let port = match (self.port, env(PORT_VAR)) {
            (Some(port), _) => port,
            (None, Some(raw)) => raw
                .trim()
                .parse()
                .map_err(|_| RunCommandError::InvalidPort(raw))?,
            (None, None) => manifest.port,
        };

        Ok(ServerOptions { host, port })
    }

    pub async fn execute(&self, ctx: &Context) -> Result<(), RunCommandError> {
        let mut manifest = ctx.manifest.clone();
        manifest.server = self.server_options(&manifest.server, |name| std::env::var(name).ok())?;

        println!();
        println!("{}", style("Strom").green());
        println!("{}", style("Starting stream coordinator").dim());
        println!();

        let broker = match &manifest.coordinator.broker.kafka_brokers {
            Some(brokers) => format!("kafka ({})", brokers),
            None => "in-process".to_string(),
        };
        println!("{} {}", style("Manifest dir").dim(), ctx.manifest_dir.display());
        println!("{} {}", style("Broker").dim(), broker);
        println!("{} {}", style("Topic").dim(), manifest.coordinator.broker.topic);
        println!();

        let base = format!("http://{}:{}", manifest.server.host, manifest.server.port);
        println!("{}", style("Endpoints").dim());
        println!("  POST {}/api/define", base);
        println!("  POST {}/api/add-source", base);
        println!("  POST {}/api/load", base);
        println!("  POST {}/api/kafka/load", base);
        println!("  GET  {}/api/get/events?range=ALL&token=<token>", base);
        println!("  POST {}/new_event", base);
        println!("  GET  {}/api/events", base);
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();

        strom_core::start_server(manifest).await?;
        Ok(())
    }
}
