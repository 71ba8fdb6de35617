//! Outbound dialing towards the gateway.
//!
//! The gateway is reached either directly or through an egress proxy named by
//! URL: `socks5://` (RFC 1928, optionally with username/password) or `http://`
//! (HTTP CONNECT). Corporate networks that only allow HTTP egress are the
//! reason this exists at all.

use super::TransportError;
use base64::Engine;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Timeout for each TCP connect.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS version
const SOCKS_VERSION: u8 = 0x05;

/// Dial `host:port`, through the proxy if one is configured.
pub async fn dial(
    proxy: Option<&Url>,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    match proxy {
        None => dial_direct(host, port).await,
        Some(url) => {
            debug!(proxy = %url, "using proxy");
            match url.scheme() {
                "socks5" | "socks5h" => dial_socks5(url, host, port).await,
                "http" => dial_http_connect(url, host, port).await,
                scheme => Err(TransportError::Proxy(format!(
                    "unsupported proxy scheme: {scheme}"
                ))),
            }
        }
    }
}

async fn dial_direct(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn proxy_endpoint(url: &Url) -> Result<(&str, u16), TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("proxy URL has no host: {url}")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TransportError::InvalidUrl(format!("proxy URL has no port: {url}")))?;
    Ok((host, port))
}

/// Connect through a SOCKS5 proxy (CONNECT command only).
async fn dial_socks5(proxy: &Url, host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let (proxy_host, proxy_port) = proxy_endpoint(proxy)?;
    let mut stream = dial_direct(proxy_host, proxy_port).await?;

    let with_auth = !proxy.username().is_empty();

    // Method negotiation
    if with_auth {
        stream.write_all(&[SOCKS_VERSION, 2, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 1, 0x00]).await?;
    }

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(TransportError::Proxy(format!(
            "bad SOCKS version from proxy: {}",
            reply[0]
        )));
    }
    match reply[1] {
        0x00 => {}
        0x02 => {
            if !with_auth {
                return Err(TransportError::Proxy(
                    "proxy requires authentication".to_string(),
                ));
            }
            socks5_password_auth(&mut stream, proxy).await?;
        }
        0xFF => {
            return Err(TransportError::Proxy(
                "proxy accepted no authentication method".to_string(),
            ))
        }
        method => {
            return Err(TransportError::Proxy(format!(
                "proxy selected unsupported method: {method:#04x}"
            )))
        }
    }

    // CONNECT request
    let mut request = vec![SOCKS_VERSION, 0x01, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(TransportError::Proxy("hostname too long".to_string()));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: version, status, reserved, then the bound address we ignore
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(TransportError::Proxy(format!(
            "proxy refused connection (code {})",
            head[1]
        )));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        atyp => {
            return Err(TransportError::Proxy(format!(
                "proxy sent unknown address type: {atyp}"
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

/// RFC 1929 username/password subnegotiation.
async fn socks5_password_auth(stream: &mut TcpStream, proxy: &Url) -> Result<(), TransportError> {
    let user = proxy.username();
    let pass = proxy.password().unwrap_or("");
    if user.len() > 255 || pass.len() > 255 {
        return Err(TransportError::Proxy("credentials too long".to_string()));
    }

    let mut msg = vec![0x01, user.len() as u8];
    msg.extend_from_slice(user.as_bytes());
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass.as_bytes());
    stream.write_all(&msg).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(TransportError::Proxy(
            "proxy rejected credentials".to_string(),
        ));
    }
    Ok(())
}

/// Connect through an HTTP proxy with a CONNECT request.
async fn dial_http_connect(proxy: &Url, host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let (proxy_host, proxy_port) = proxy_endpoint(proxy)?;
    let mut stream = dial_direct(proxy_host, proxy_port).await?;

    let authority = format_authority(host, port);
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let response = read_http_response_head(&mut stream).await?;
    let status_line = response.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(TransportError::Proxy(format!(
            "proxy CONNECT failed: {status_line}"
        )));
    }

    Ok(stream)
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Read up to the blank line ending the response head. Byte-at-a-time so no
/// tunneled bytes are consumed past the terminator.
async fn read_http_response_head(stream: &mut TcpStream) -> Result<String, TransportError> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(TransportError::Proxy("response head too large".to_string()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| TransportError::Proxy("non-UTF-8 response".to_string()))
}
