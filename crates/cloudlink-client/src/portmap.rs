//! UPnP port mapping
//!
//! Discovers the Internet Gateway Device with an SSDP M-SEARCH, reads its
//! description to find the WAN connection control URL, then issues a SOAP
//! `AddPortMapping`. The controller renews the mapping on every periodic
//! refresh, well inside the lease.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use crate::error::{ReachError, Result};

/// Lease requested for each mapping
pub const MAPPING_TTL: Duration = Duration::from_secs(1800);

const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const SOAP_TIMEOUT: Duration = Duration::from_secs(10);

const SEARCH_TARGETS: &[&str] = &[
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// A TCP mapping request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub public_port: u16,
    /// LAN address to forward to; detected when absent
    pub private_host: Option<IpAddr>,
    pub private_port: u16,
    pub ttl: Duration,
    pub description: String,
}

#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn map_port(&self, mapping: &PortMapping) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Gateway {
    control_url: Url,
    service_type: String,
}

pub struct UpnpPortMapper {
    http: reqwest::Client,
    gateway: Mutex<Option<Gateway>>,
}

impl UpnpPortMapper {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder().timeout(SOAP_TIMEOUT).build()?;
        Ok(Self {
            http,
            gateway: Mutex::new(None),
        })
    }

    async fn gateway(&self) -> Result<Gateway> {
        let mut cached = self.gateway.lock().await;
        if let Some(gateway) = cached.as_ref() {
            return Ok(gateway.clone());
        }

        let mut last_error = None;
        for target in SEARCH_TARGETS {
            match self.discover(target).await {
                Ok(gateway) => {
                    info!(
                        "UPnP gateway found: {} ({})",
                        gateway.control_url, gateway.service_type
                    );
                    *cached = Some(gateway.clone());
                    return Ok(gateway);
                }
                Err(e) => {
                    debug!("SSDP discovery for {} failed: {}", target, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ReachError::Mapping("no UPnP gateway found".to_string())))
    }

    async fn discover(&self, search_target: &str) -> Result<Gateway> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let request = msearch_request(search_target);
        let multicast: SocketAddr = SSDP_MULTICAST_ADDR
            .parse()
            .map_err(|e| ReachError::Mapping(format!("bad multicast address: {}", e)))?;
        socket.send_to(request.as_bytes(), multicast).await?;

        let mut buf = [0u8; 2048];
        let (len, src) = timeout(DISCOVERY_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ReachError::Mapping("SSDP discovery timed out".to_string()))??;
        let response = String::from_utf8_lossy(&buf[..len]);
        debug!("SSDP response from {}: {}", src, response);

        let location = parse_ssdp_header(&response, "LOCATION")
            .ok_or_else(|| ReachError::Mapping("SSDP response has no LOCATION".to_string()))?;
        let service_type =
            parse_ssdp_header(&response, "ST").unwrap_or_else(|| search_target.to_string());

        let location = Url::parse(&location)
            .map_err(|e| ReachError::Mapping(format!("bad LOCATION {}: {}", location, e)))?;
        let description = self
            .http
            .get(location.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReachError::Mapping(format!("device description: {}", e)))?
            .text()
            .await
            .map_err(|e| ReachError::Mapping(format!("device description: {}", e)))?;

        let control_url = find_control_url(&description, &location, &service_type)
            .ok_or_else(|| {
                ReachError::Mapping(format!("no control URL for {}", service_type))
            })?;

        Ok(Gateway {
            control_url,
            service_type,
        })
    }

    async fn add_port_mapping(
        &self,
        gateway: &Gateway,
        mapping: &PortMapping,
        internal_client: IpAddr,
    ) -> Result<()> {
        let body = add_port_mapping_envelope(&gateway.service_type, mapping, internal_client);
        let action = format!("\"{}#AddPortMapping\"", gateway.service_type);

        let response = self
            .http
            .post(gateway.control_url.clone())
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", action)
            .body(body)
            .send()
            .await
            .map_err(|e| ReachError::Mapping(format!("AddPortMapping: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if let Some(code) = soap_error_code(&text) {
            return Err(ReachError::Mapping(format!(
                "AddPortMapping failed with UPnP error {}",
                code
            )));
        }
        if !status.is_success() {
            return Err(ReachError::Mapping(format!(
                "AddPortMapping failed with HTTP {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PortMapper for UpnpPortMapper {
    async fn map_port(&self, mapping: &PortMapping) -> Result<()> {
        let gateway = self.gateway().await?;
        let internal_client = match mapping.private_host {
            Some(host) => host,
            None => local_ip().await?,
        };

        if let Err(e) = self.add_port_mapping(&gateway, mapping, internal_client).await {
            // The router may have restarted with a different control URL
            *self.gateway.lock().await = None;
            return Err(e);
        }

        info!(
            "UPnP mapping {} -> {}:{} (lease {}s)",
            mapping.public_port,
            internal_client,
            mapping.private_port,
            mapping.ttl.as_secs()
        );
        Ok(())
    }
}

/// LAN address used for outbound traffic
async fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:53").await?;
    Ok(socket.local_addr()?.ip())
}

fn msearch_request(search_target: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         ST: {}\r\n\
         MX: 2\r\n\
         \r\n",
        search_target
    )
}

fn parse_ssdp_header(response: &str, header: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case(header)
            .then(|| value.trim().to_string())
    })
}

/// Control URL of `service_type` in a device description, resolved
/// against the description's location
fn find_control_url(xml: &str, location: &Url, service_type: &str) -> Option<Url> {
    let marker = format!("<serviceType>{}</serviceType>", service_type);
    let service_idx = xml.find(&marker)?;
    let section = &xml[service_idx..];
    let start = section.find("<controlURL>")? + "<controlURL>".len();
    let end = section[start..].find("</controlURL>")? + start;
    location.join(section[start..end].trim()).ok()
}

fn add_port_mapping_envelope(
    service_type: &str,
    mapping: &PortMapping,
    internal_client: IpAddr,
) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:AddPortMapping xmlns:u="{}">
<NewRemoteHost></NewRemoteHost>
<NewExternalPort>{}</NewExternalPort>
<NewProtocol>TCP</NewProtocol>
<NewInternalPort>{}</NewInternalPort>
<NewInternalClient>{}</NewInternalClient>
<NewEnabled>1</NewEnabled>
<NewPortMappingDescription>{}</NewPortMappingDescription>
<NewLeaseDuration>{}</NewLeaseDuration>
</u:AddPortMapping>
</s:Body>
</s:Envelope>"#,
        xml_escape(service_type),
        mapping.public_port,
        mapping.private_port,
        internal_client,
        xml_escape(&mapping.description),
        mapping.ttl.as_secs()
    )
}

fn soap_error_code(response: &str) -> Option<&str> {
    let start = response.find("<errorCode>")? + "<errorCode>".len();
    let end = response[start..].find("</errorCode>")? + start;
    Some(response[start..end].trim())
}

fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
