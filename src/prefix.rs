//! Secret URL path prefix and the share links built from it

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

const PREFIX_FILENAME: &str = "path_prefix.txt";
const PREFIX_LEN: usize = 8;
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

pub fn prefix_path() -> PathBuf {
    crate::config::exe_dir().join(PREFIX_FILENAME)
}

/// Lowercase RFC 4648 base32 without padding
pub fn base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[usize::from((buffer >> bits) & 0x1f)] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[usize::from((buffer << (5 - bits)) & 0x1f)] as char);
    }
    out
}

/// Fresh 8 character prefix from 5 random bytes
pub fn generate() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32(&bytes)
}

pub fn is_valid(prefix: &str) -> bool {
    prefix.len() == PREFIX_LEN && prefix.bytes().all(|b| BASE32_ALPHABET.contains(&b))
}

/// Read the persisted prefix, generating and saving a new one when the file is
/// missing or holds something else
pub fn load_or_generate(path: &Path) -> anyhow::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let prefix = contents.trim();
            if is_valid(prefix) {
                log::debug!("Using path prefix from {:?}", path);
                return Ok(prefix.to_string());
            }
            log::warn!("Malformed path prefix in {:?}, generating a new one", path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let prefix = generate();
    std::fs::write(path, &prefix)?;
    log::info!("Saved new path prefix to {:?}", path);
    Ok(prefix)
}

/// Address of the interface that routes to the outside world. Nothing is sent.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// URLs a phone on the same network can open
pub fn share_links(host: &str, port: u16, prefix: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => {
            if let Some(ip) = local_ip() {
                hosts.push(ip.to_string());
            }
            hosts.push("localhost".to_string());
        }
        _ => hosts.push(host.to_string()),
    }
    hosts
        .into_iter()
        .map(|host| format!("http://{}:{}/{}/", host, port, prefix))
        .collect()
}
