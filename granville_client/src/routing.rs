//! Zone routing strategy (spec §4.7 / C8): picks which registered server a
//! call should land on, given the caller's [`RoutingContext`].

use granville_shared::errors::RpcError;
use granville_shared::model::{RoutingContext, ServerDescriptor, ServerHealth};

fn is_usable(server: &ServerDescriptor) -> bool {
    !matches!(server.health, ServerHealth::Offline | ServerHealth::Unhealthy)
}

/// Chooses one server out of the registered set for a call.
pub trait RoutingStrategy: Send + Sync {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        context: &RoutingContext,
    ) -> Result<&'a ServerDescriptor, RpcError>;
}

/// Routes by the `"zone"` routing-context key matching a server's
/// `metadata["zone"]`; falls back to any usable server if no zone match
/// exists, and breaks ties by `server_id` so routing is reproducible across
/// runs given the same registered set (spec §8 "zone handoff").
pub struct ZoneRoutingStrategy;

impl RoutingStrategy for ZoneRoutingStrategy {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        context: &RoutingContext,
    ) -> Result<&'a ServerDescriptor, RpcError> {
        let zone = context.get_str("zone");

        let mut candidates: Vec<&ServerDescriptor> = zone
            .map(|zone| {
                servers
                    .iter()
                    .filter(|s| is_usable(s) && s.zone() == Some(zone))
                    .collect()
            })
            .unwrap_or_default();

        if candidates.is_empty() {
            candidates = servers.iter().filter(|s| is_usable(s)).collect();
        }

        candidates.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        candidates.into_iter().next().ok_or(RpcError::Routing)
    }
}

/// Routes to the designated primary server, falling back to any usable
/// server; used by interfaces that aren't zone-aware.
pub struct PrimaryRoutingStrategy;

impl RoutingStrategy for PrimaryRoutingStrategy {
    fn select<'a>(
        &self,
        servers: &'a [ServerDescriptor],
        _context: &RoutingContext,
    ) -> Result<&'a ServerDescriptor, RpcError> {
        servers
            .iter()
            .find(|s| s.is_primary && is_usable(s))
            .or_else(|| servers.iter().find(|s| is_usable(s)))
            .ok_or(RpcError::Routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, zone: &str) -> ServerDescriptor {
        ServerDescriptor::new(id, "127.0.0.1", 40000)
            .with_metadata("zone", zone)
            .with_health(ServerHealth::Healthy)
    }

    #[test]
    fn zone_routing_prefers_matching_zone() {
        let servers = vec![server("a", "0,0"), server("b", "1,0")];
        let mut ctx = RoutingContext::new();
        ctx.set("zone", "1,0");
        let chosen = ZoneRoutingStrategy.select(&servers, &ctx).unwrap();
        assert_eq!(chosen.server_id, "b");
    }

    #[test]
    fn zone_routing_falls_back_when_no_zone_matches() {
        let servers = vec![server("a", "0,0")];
        let mut ctx = RoutingContext::new();
        ctx.set("zone", "9,9");
        let chosen = ZoneRoutingStrategy.select(&servers, &ctx).unwrap();
        assert_eq!(chosen.server_id, "a");
    }

    #[test]
    fn zone_routing_errors_with_no_usable_servers() {
        let mut offline = server("a", "0,0");
        offline.health = ServerHealth::Offline;
        let ctx = RoutingContext::new();
        let err = ZoneRoutingStrategy.select(&[offline], &ctx).unwrap_err();
        assert!(matches!(err, RpcError::Routing));
    }

    #[test]
    fn primary_routing_prefers_primary_flag() {
        let mut a = server("a", "0,0");
        let mut b = server("b", "0,0").with_primary(true);
        a.is_primary = false;
        b.is_primary = true;
        let ctx = RoutingContext::new();
        let chosen = PrimaryRoutingStrategy.select(&[a, b], &ctx).unwrap();
        assert_eq!(chosen.server_id, "b");
    }
}
