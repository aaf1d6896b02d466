//! NAT type discovery.
//!
//! The probe sequence is a fixed tree:
//!
//! 1. a plain request to the server; silence means UDP is blocked;
//! 2. the mapped address is compared with our own address to detect "no NAT";
//! 3. mapping: the request is repeated towards the server's other IP and, if
//!    the mapping changed, towards its other port (CHANGED-ADDRESS);
//! 4. filtering: the server is asked to answer from its other IP and port, then
//!    from its other port only.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::attributes::ChangeRequest;
use crate::config::ClientConfig;
use crate::endpoint::resolve_addr;
use crate::error::ClientError;
use crate::prober::{routed_local_ip, BindingResponse, CancelToken, Prober, UdpProber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingBehavior {
    /// Same external address whatever the destination ("consistent").
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilteringBehavior {
    EndpointIndependent,
    AddressDependent,
    AddressAndPortDependent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatType {
    UdpBlocked,
    OpenInternet,
    SymmetricUdpFirewall,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

impl NatType {
    /// Combines the observed behaviors into the classic label.
    pub fn classify(no_nat: bool, mapping: MappingBehavior, filtering: FilteringBehavior) -> Self {
        match (no_nat, mapping, filtering) {
            (true, _, FilteringBehavior::EndpointIndependent) => NatType::OpenInternet,
            (true, _, _) => NatType::SymmetricUdpFirewall,
            (false, MappingBehavior::EndpointIndependent, FilteringBehavior::EndpointIndependent) => {
                NatType::FullCone
            }
            (false, MappingBehavior::EndpointIndependent, FilteringBehavior::AddressDependent) => {
                NatType::RestrictedCone
            }
            (
                false,
                MappingBehavior::EndpointIndependent,
                FilteringBehavior::AddressAndPortDependent,
            ) => NatType::PortRestrictedCone,
            (false, _, _) => NatType::Symmetric,
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NatType::UdpBlocked => "UDP Blocked",
            NatType::OpenInternet => "Open Internet",
            NatType::SymmetricUdpFirewall => "Symmetric UDP Firewall",
            NatType::FullCone => "Full Cone",
            NatType::RestrictedCone => "Restricted Cone",
            NatType::PortRestrictedCone => "Port Restricted Cone",
            NatType::Symmetric => "Symmetric",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// Plain request to the server.
    Basic,
    /// Plain request to the server's other IP.
    OtherIp,
    /// Plain request to the advertised CHANGED-ADDRESS.
    OtherPort,
    /// CHANGE-REQUEST for both IP and port.
    ChangeIpPort,
    /// CHANGE-REQUEST for the port only.
    ChangePort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub probe: ProbeKind,
    pub target: SocketAddr,
    pub mapped: Option<SocketAddr>,
    pub responder: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub nat_type: NatType,
    pub mapping: Option<MappingBehavior>,
    pub filtering: Option<FilteringBehavior>,
    pub external: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub observations: Vec<Observation>,
}

impl Classification {
    pub fn external_ip(&self) -> String {
        self.external
            .map_or_else(|| "None".to_string(), |a| a.ip().to_string())
    }

    pub fn external_port(&self) -> String {
        self.external
            .map_or_else(|| "None".to_string(), |a| a.port().to_string())
    }
}

/// Runs the probe sequence against `server` (and `alternate`, the server's
/// other IP, when known).
pub struct NatClassifier<P> {
    prober: P,
    server: SocketAddr,
    alternate: Option<SocketAddr>,
    observations: Vec<Observation>,
}

impl<P: Prober> NatClassifier<P> {
    pub fn new(prober: P, server: SocketAddr, alternate: Option<SocketAddr>) -> Self {
        NatClassifier {
            prober,
            server,
            alternate,
            observations: Vec::new(),
        }
    }

    fn probe(
        &mut self,
        kind: ProbeKind,
        target: SocketAddr,
        change: Option<ChangeRequest>,
    ) -> Result<Option<BindingResponse>, ClientError> {
        let resp = self.prober.probe(target, change)?;
        self.observations.push(Observation {
            probe: kind,
            target,
            mapped: resp.map(|r| r.mapped),
            responder: resp.map(|r| r.responder),
        });
        debug!(?kind, %target, ?resp, "probe finished");
        Ok(resp)
    }

    fn local_endpoint(&self) -> Result<SocketAddr, ClientError> {
        let mut local = self.prober.local_addr()?;
        if local.ip().is_unspecified() {
            if let Some(ip) = routed_local_ip(self.server) {
                local.set_ip(ip);
            }
        }
        Ok(local)
    }

    pub fn discover(mut self) -> Result<Classification, ClientError> {
        let Some(first) = self.probe(ProbeKind::Basic, self.server, None)? else {
            info!(server = %self.server, "no response, UDP blocked");
            return Ok(Classification {
                nat_type: NatType::UdpBlocked,
                mapping: None,
                filtering: None,
                external: None,
                local: None,
                observations: self.observations,
            });
        };
        let local = self.local_endpoint()?;
        let no_nat = first.mapped == local;
        debug!(mapped = %first.mapped, %local, no_nat, "basic binding");

        let mapping = if no_nat {
            MappingBehavior::EndpointIndependent
        } else {
            self.mapping_behavior(&first)?
        };
        let filtering = self.filtering_behavior()?;
        let nat_type = NatType::classify(no_nat, mapping, filtering);
        info!(%nat_type, ?mapping, ?filtering, external = %first.mapped, "classified");

        Ok(Classification {
            nat_type,
            mapping: Some(mapping),
            filtering: Some(filtering),
            external: Some(first.mapped),
            local: Some(local),
            observations: self.observations,
        })
    }

    fn mapping_behavior(&mut self, first: &BindingResponse) -> Result<MappingBehavior, ClientError> {
        let ip_changed = match self.alternate {
            Some(target) => self
                .probe(ProbeKind::OtherIp, target, None)?
                .map(|r| r.mapped != first.mapped),
            None => None,
        };
        if ip_changed == Some(false) {
            return Ok(MappingBehavior::EndpointIndependent);
        }

        let port_changed = match first.changed {
            Some(target) if target != self.server => self
                .probe(ProbeKind::OtherPort, target, None)?
                .map(|r| r.mapped != first.mapped),
            _ => None,
        };

        Ok(match (ip_changed, port_changed) {
            (_, Some(true)) => MappingBehavior::AddressAndPortDependent,
            (Some(true), _) => MappingBehavior::AddressDependent,
            _ => MappingBehavior::EndpointIndependent,
        })
    }

    fn filtering_behavior(&mut self) -> Result<FilteringBehavior, ClientError> {
        let both = Some(ChangeRequest::new(true, true));
        if self.probe(ProbeKind::ChangeIpPort, self.server, both)?.is_some() {
            return Ok(FilteringBehavior::EndpointIndependent);
        }
        let port = Some(ChangeRequest::new(false, true));
        if self.probe(ProbeKind::ChangePort, self.server, port)?.is_some() {
            return Ok(FilteringBehavior::AddressDependent);
        }
        Ok(FilteringBehavior::AddressAndPortDependent)
    }
}

/// Resolves the configured server, binds a probe socket and runs discovery.
pub fn discover(config: &ClientConfig, cancel: CancelToken) -> Result<Classification, ClientError> {
    let server = resolve_addr(&config.server)?;
    let alternate = config.alternate.as_deref().map(resolve_addr).transpose()?;
    let mut prober =
        UdpProber::bind(&config.local_bind(), config.timeout, config.retries)?.with_cancel(cancel);
    if let Some(limit) = config.deadline {
        prober = prober.with_deadline(Instant::now() + limit);
    }
    NatClassifier::new(prober, server, alternate).discover()
}
