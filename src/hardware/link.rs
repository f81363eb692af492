/// Network link bring-up
///
/// On the node this is the WiFi station interface. Credential handling and
/// radio drivers are external; the transport only needs "bring it up" and
/// "reset it".
use futures_util::future::BoxFuture;
use log::{debug, info};

use crate::error::LinkError;

pub trait Link: Send {
    /// Bring the link up. Callers bound this with their own timeout.
    fn connect(&mut self) -> BoxFuture<'_, Result<(), LinkError>>;
    /// Reset the interface itself, for radios stuck in a bad state.
    fn reset(&mut self) -> BoxFuture<'_, ()>;
}

/// Host link: considered up once the gateway address resolves.
pub struct HostLink {
    target: String,
}

impl HostLink {
    pub fn new(host: &str, port: u16) -> Self {
        HostLink {
            target: format!("{}:{}", host, port),
        }
    }
}

impl Link for HostLink {
    fn connect(&mut self) -> BoxFuture<'_, Result<(), LinkError>> {
        Box::pin(async move {
            let mut addrs = tokio::net::lookup_host(self.target.as_str())
                .await
                .map_err(|e| LinkError::Unavailable(format!("{}: {}", self.target, e)))?;
            match addrs.next() {
                Some(addr) => {
                    debug!("Link up, gateway resolves to {}", addr);
                    Ok(())
                }
                None => Err(LinkError::Unavailable(format!(
                    "{} has no addresses",
                    self.target
                ))),
            }
        })
    }

    fn reset(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!("Resetting host link to {}", self.target);
        })
    }
}
