//! One toolgate invocation: fetch the tool, start the proxy, run the child.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use toolgate_release::{BinaryCache, Fetch, HttpFetcher, Platform, Progress};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ca::CaStore;
use crate::config::Config;
use crate::credentials::{CredentialInjector, CredentialSource, EnvCredentialSource};
use crate::interceptor::{HostMatcher, Interceptor};
use crate::launcher::Launcher;
use crate::proxy::{InterceptProxy, Negotiator, ProxyInfo, ProxyOptions};
use crate::Result;

/// Argument that makes the wrapper run the tool's own help, unproxied.
const HELP_ARG: &str = "help";

pub struct Session {
    config: Config,
    ca: Arc<CaStore>,
    fetcher: Arc<dyn Fetch>,
    platform: Platform,
    extra_ca_file: Option<PathBuf>,
    negotiator: Option<Arc<dyn Negotiator>>,
    credential_source: Option<Arc<dyn CredentialSource>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Session {
    /// Session over `config` using the host platform and an HTTP fetcher.
    ///
    /// Extra trust roots are read from the file named by the
    /// `proxy.extra_ca_env` variable, if set.
    pub fn new(config: Config, ca: Arc<CaStore>) -> Result<Self> {
        let extra_ca_file = std::env::var(&config.proxy.extra_ca_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(Self {
            config,
            ca,
            fetcher: Arc::new(HttpFetcher::new()?),
            platform: Platform::host(),
            extra_ca_file,
            negotiator: None,
            credential_source: None,
            interceptors: Vec::new(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_extra_ca_file(mut self, path: Option<PathBuf>) -> Self {
        self.extra_ca_file = path;
        self
    }

    pub fn with_negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Replace the environment-backed credential source.
    pub fn with_credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credential_source = Some(source);
        self
    }

    /// Extra interceptor, run after credential injection.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> BinaryCache {
        BinaryCache::new(
            self.config.cache_dir.clone(),
            self.config.tool.release_source(),
            Arc::clone(&self.fetcher),
        )
        .with_policy(self.config.tool.corrupt_cache)
    }

    /// Resolve, download if needed, and verify the tool binary.
    pub async fn fetch(&self, progress: &dyn Progress) -> Result<PathBuf> {
        let version = self.config.tool.version_spec()?;
        tokio::fs::create_dir_all(&self.config.cache_dir)
            .await
            .map_err(|e| {
                crate::Error::io(
                    format!("create cache directory {}", self.config.cache_dir.display()),
                    e,
                )
            })?;
        let path = self
            .cache()
            .resolve_verified_binary(&self.platform, &version, progress)
            .await?;
        info!(path = %path.display(), "tool binary ready");
        Ok(path)
    }

    /// Create the CA if needed and start a configured proxy.
    pub async fn start_proxy(&self) -> Result<InterceptProxy> {
        let ca = self.ca.get_or_create()?;
        let mut options = ProxyOptions::from_config(&self.config.proxy);
        options.extra_ca_file = self.extra_ca_file.clone();

        let proxy = InterceptProxy::new(options, &ca)?;
        if let Some(negotiator) = &self.negotiator {
            proxy.set_negotiator(Arc::clone(negotiator));
        }
        proxy.set_upstream_proxy(
            self.config.proxy.upstream.as_deref(),
            self.config.proxy.upstream_auth,
        )?;

        let creds = &self.config.credentials;
        if creds.enabled {
            let source = self
                .credential_source
                .clone()
                .unwrap_or_else(|| Arc::new(EnvCredentialSource::from_config(creds)));
            proxy.register_interceptor(Arc::new(CredentialInjector::new(
                source,
                HostMatcher::new(&creds.inject_hosts),
            )));
        }
        for interceptor in &self.interceptors {
            proxy.register_interceptor(Arc::clone(interceptor));
        }

        proxy.start().await?;
        Ok(proxy)
    }

    /// Fetch the tool and run it with `args`.
    ///
    /// The proxy is bound before the child starts and closed after it exits.
    /// `help` anywhere in `args` runs only `<tool> help`, without the proxy.
    pub async fn run(
        &self,
        args: &[String],
        client_id: Option<Uuid>,
        progress: &dyn Progress,
    ) -> Result<i32> {
        let binary = self.fetch(progress).await?;
        let launcher = Launcher::from_config(&self.config.proxy);

        if wants_help(args) {
            debug!("running tool help without proxy");
            return launcher.run(&binary, &[HELP_ARG.to_string()], None).await;
        }

        let args = child_args(args, client_id);
        if !self.config.proxy.enabled {
            return launcher.run(&binary, &args, None).await;
        }

        let proxy = self.start_proxy().await?;
        let info = proxy.proxy_info()?;
        let result = launcher.run(&binary, &args, Some(&info)).await;
        proxy.close();
        result
    }

    /// Run only the proxy until `shutdown` resolves. `on_ready` receives the
    /// connection details once the port is bound.
    pub async fn serve_proxy<F, R>(&self, on_ready: R, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
        R: FnOnce(&ProxyInfo),
    {
        let proxy = self.start_proxy().await?;
        on_ready(&proxy.proxy_info()?);
        shutdown.await;
        proxy.close();
        Ok(())
    }
}

fn wants_help(args: &[String]) -> bool {
    args.iter().any(|a| a == HELP_ARG)
}

/// Arguments handed to the tool: the caller's, plus the client identifier.
fn child_args(args: &[String], client_id: Option<Uuid>) -> Vec<String> {
    let mut out = args.to_vec();
    if let Some(id) = client_id {
        out.push("--client-id".to_string());
        out.push(id.hyphenated().to_string());
    }
    out
}
