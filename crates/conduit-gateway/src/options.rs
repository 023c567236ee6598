//! Command-line surface of the gateway.

use std::path::PathBuf;
use std::time::Duration;

use conduit_core::config::DEFAULT_BROKER_PORT;
use conduit_core::endpoint::Endpoint;
use conduit_core::PeerId;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub inbound_port: u16,
    pub broker_endpoints: Vec<Endpoint>,
    pub private_key_file: PathBuf,
    pub certificate_file: PathBuf,
    /// Fixed identity; generated at startup when absent.
    pub source_peer_id: Option<PeerId>,
    pub target_peer_id: PeerId,
    pub token_cookie_names: Vec<String>,
    pub token_type_default: Option<String>,
    pub token_data_default: Option<String>,
    pub request_timeout: Option<Duration>,
    pub connections: usize,
    pub no_server_authentication_required: bool,
    pub expected_security_id: Option<String>,
    pub log_unauthorized_messages: bool,
    pub verify_root_ca: Option<PathBuf>,
}

pub fn usage() -> String {
    [
        "Usage: conduit-gateway [options]",
        "",
        "Required",
        "  --inbound-port <port>               TCP port the HTTPS listener binds to",
        "  --broker-endpoints <list>           Comma-separated host[:port] broker list",
        "  --private-key-file <path>           PEM private key for the TLS server identity",
        "  --certificate-file <path>           PEM certificate for the TLS server identity",
        "  --target-peer-id <uuid>             Peer id requests are forwarded to",
        "",
        "Optional",
        "  --source-peer-id <uuid>             Fixed gateway identity (default: generated)",
        "  --token-cookie-name <name>          Cookie to scan for the auth token (repeatable)",
        "  --token-type-default <type>         Fallback token type when no cookie matches",
        "  --token-data-default <data>         Fallback token data when no cookie matches",
        "  --request-timeout-in-seconds <n>    Bound on request/response correlation",
        "  --connections <n>                   Minimum outbound connections to the brokers",
        "  --no-server-authentication-required Allow anonymous requests",
        "  --expected-security-id <sid>        Require the principal to match this id",
        "  --log-unauthorized-messages         Verbose logging for 401 responses",
        "  --verify-root-ca <path>             Additional PEM root certificate to trust",
    ]
    .join("\n")
}

/// Parse the argument list (without the program name).
pub fn parse_args(args: &[String]) -> Result<GatewayOptions, String> {
    let mut inbound_port: Option<u16> = None;
    let mut broker_endpoints: Vec<Endpoint> = Vec::new();
    let mut private_key_file: Option<PathBuf> = None;
    let mut certificate_file: Option<PathBuf> = None;
    let mut source_peer_id: Option<PeerId> = None;
    let mut target_peer_id: Option<PeerId> = None;
    let mut token_cookie_names: Vec<String> = Vec::new();
    let mut token_type_default: Option<String> = None;
    let mut token_data_default: Option<String> = None;
    let mut request_timeout: Option<Duration> = None;
    let mut connections: usize = 0;
    let mut no_server_authentication_required = false;
    let mut expected_security_id: Option<String> = None;
    let mut log_unauthorized_messages = false;
    let mut verify_root_ca: Option<PathBuf> = None;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| -> Result<String, String> {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("missing value for {name}"))
        };

        match flag.as_str() {
            "--inbound-port" => {
                inbound_port = Some(
                    value("--inbound-port")?
                        .parse()
                        .map_err(|_| "invalid --inbound-port".to_string())?,
                );
            }
            "--broker-endpoints" => {
                for part in value("--broker-endpoints")?.split(',') {
                    match Endpoint::parse(part, DEFAULT_BROKER_PORT) {
                        Some(endpoint) => broker_endpoints.push(endpoint),
                        None => return Err(format!("invalid broker endpoint: {part:?}")),
                    }
                }
            }
            "--private-key-file" => private_key_file = Some(value("--private-key-file")?.into()),
            "--certificate-file" => certificate_file = Some(value("--certificate-file")?.into()),
            "--source-peer-id" => {
                source_peer_id = Some(
                    PeerId::parse(&value("--source-peer-id")?)
                        .map_err(|_| "invalid --source-peer-id".to_string())?,
                );
            }
            "--target-peer-id" => {
                target_peer_id = Some(
                    PeerId::parse(&value("--target-peer-id")?)
                        .map_err(|_| "invalid --target-peer-id".to_string())?,
                );
            }
            "--token-cookie-name" => token_cookie_names.push(value("--token-cookie-name")?),
            "--token-type-default" => token_type_default = Some(value("--token-type-default")?),
            "--token-data-default" => token_data_default = Some(value("--token-data-default")?),
            "--request-timeout-in-seconds" => {
                let seconds: u64 = value("--request-timeout-in-seconds")?
                    .parse()
                    .map_err(|_| "invalid --request-timeout-in-seconds".to_string())?;
                request_timeout = Some(Duration::from_secs(seconds));
            }
            "--connections" => {
                connections = value("--connections")?
                    .parse()
                    .map_err(|_| "invalid --connections".to_string())?;
            }
            "--no-server-authentication-required" => no_server_authentication_required = true,
            "--expected-security-id" => {
                expected_security_id = Some(value("--expected-security-id")?)
            }
            "--log-unauthorized-messages" => log_unauthorized_messages = true,
            "--verify-root-ca" => verify_root_ca = Some(value("--verify-root-ca")?.into()),
            other => return Err(format!("unknown option: {other}")),
        }
    }

    let options = GatewayOptions {
        inbound_port: inbound_port.ok_or("--inbound-port is required")?,
        broker_endpoints: if broker_endpoints.is_empty() {
            return Err("--broker-endpoints is required".to_string());
        } else {
            broker_endpoints
        },
        private_key_file: private_key_file.ok_or("--private-key-file is required")?,
        certificate_file: certificate_file.ok_or("--certificate-file is required")?,
        source_peer_id,
        target_peer_id: target_peer_id.ok_or("--target-peer-id is required")?,
        token_cookie_names,
        token_type_default,
        token_data_default,
        request_timeout,
        connections,
        no_server_authentication_required,
        expected_security_id,
        log_unauthorized_messages,
        verify_root_ca,
    };

    Ok(options)
}
