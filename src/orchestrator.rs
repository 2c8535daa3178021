//! Service orchestration: one honeypot server per configured service
//! instance, supervised so a single bad service never takes down siblings.

use crate::config::{Config, ServiceConfig, ServiceKind};
use crate::dns::{dns_tcp_factory, DnsProxy, DEFAULT_UPSTREAM};
use crate::handler::{BaseHandler, DatagramHandler};
use crate::logger::EventLogger;
use crate::server::HoneypotServer;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ServiceOrchestrator {
    servers: Vec<HoneypotServer>,
}

impl ServiceOrchestrator {
    pub fn new(config: &Config, logger: Arc<dyn EventLogger>) -> Self {
        let servers = config
            .services
            .iter()
            .map(|(kind, service)| build_server(*kind, service, config.listen_addr, logger.clone()))
            .collect();
        Self { servers }
    }

    /// Starts every configured server. A startup failure (typically a bind
    /// conflict) is logged and stays local to that service; siblings keep
    /// going. Returns how many servers reached Running.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for server in &self.servers {
            match server.start().await {
                Ok(()) => started += 1,
                Err(e) => warn!(
                    service = server.service(),
                    port = server.port(),
                    error = %e,
                    "service failed to start"
                ),
            }
        }
        info!(started, total = self.servers.len(), "services started");
        started
    }

    pub async fn stop_all(&self) {
        for server in &self.servers {
            if let Err(e) = server.stop().await {
                warn!(service = server.service(), error = %e, "stop failed");
            }
        }
    }

    pub fn servers(&self) -> &[HoneypotServer] {
        &self.servers
    }
}

fn build_server(
    kind: ServiceKind,
    service: &ServiceConfig,
    bindaddr: IpAddr,
    logger: Arc<dyn EventLogger>,
) -> HoneypotServer {
    match kind {
        // DNS binds UDP (the proxy) and TCP (presence only) on one port.
        ServiceKind::Dns => {
            let upstream = service.upstream.unwrap_or(DEFAULT_UPSTREAM);
            let proxy: Arc<dyn DatagramHandler> =
                Arc::new(DnsProxy::new(logger.clone(), upstream));
            HoneypotServer::new(
                "dns",
                bindaddr,
                service.port,
                Some(dns_tcp_factory(logger)),
                Some(proxy),
            )
        }
        _ => HoneypotServer::new(
            kind.name(),
            bindaddr,
            service.port,
            Some(BaseHandler::factory(kind.name(), logger)),
            None,
        ),
    }
}
