//! Hostname canonicalization and the static blocked-IP-range table used to
//! keep every dial off of loopback, private, link-local, and metadata
//! addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// Canonicalize a host for allowlist/secret lookups: lowercase, strip a
/// trailing dot (a valid absolute-name suffix that otherwise breaks suffix
/// matching), and strip a `:port` suffix if present. IPv6 literals given in
/// bracket form (`[::1]:8080`) are unwrapped to their bare form (`::1`).
pub fn canonicalize_host(input: &str) -> String {
	let s = input.trim();

	// bracketed IPv6 literal, optionally with a port
	if let Some(rest) = s.strip_prefix('[') {
		if let Some(end) = rest.find(']') {
			return rest[..end].to_ascii_lowercase();
		}
	}

	// bare IPv6 literal (contains more than one colon) passes through untouched
	// aside from case, since ':' is not a port separator here
	if s.matches(':').count() > 1 {
		let trimmed = s.trim_end_matches('.');
		return trimmed.to_ascii_lowercase();
	}

	let without_port = match s.rfind(':') {
		Some(idx) if s[idx + 1..].chars().all(|c| c.is_ascii_digit()) && !s[idx + 1..].is_empty() => {
			&s[..idx]
		}
		_ => s,
	};
	let without_trailing_dot = without_port.trim_end_matches('.');
	without_trailing_dot.to_ascii_lowercase()
}

/// Parse a canonicalized host as an IP literal, if it is one.
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
	host.parse::<IpAddr>().ok()
}

fn v4_blocklist() -> &'static [Ipv4Net] {
	use std::sync::OnceLock;
	static NETS: OnceLock<Vec<Ipv4Net>> = OnceLock::new();
	NETS.get_or_init(|| {
		[
			"0.0.0.0/8",
			"10.0.0.0/8",
			"100.64.0.0/10",
			"127.0.0.0/8",
			"169.254.0.0/16",
			"172.16.0.0/12",
			"192.0.0.0/24",
			"192.0.2.0/24",
			"192.168.0.0/16",
			"198.18.0.0/15",
			"198.51.100.0/24",
			"203.0.113.0/24",
			"224.0.0.0/4",
			"240.0.0.0/4",
			"255.255.255.255/32",
		]
		.iter()
		.map(|s| s.parse().unwrap())
		.collect()
	})
	.as_slice()
}

fn v6_blocklist() -> &'static [Ipv6Net] {
	use std::sync::OnceLock;
	static NETS: OnceLock<Vec<Ipv6Net>> = OnceLock::new();
	NETS.get_or_init(|| {
		[
			"::1/128",
			"::/128",
			"::ffff:0:0/96",
			"fc00::/7",
			"fe80::/10",
			"2001:db8::/32",
			"ff00::/8",
		]
		.iter()
		.map(|s| s.parse().unwrap())
		.collect()
	})
	.as_slice()
}

/// Whether an address falls in a range that must never be dialed: loopback,
/// RFC1918 private space, link-local (including the `169.254.0.0/16` cloud
/// metadata range), CGNAT (`100.64.0.0/10`), multicast/reserved, or the IPv6
/// analogues (`::1`, ULA `fc00::/7`, link-local `fe80::/10`).
pub fn is_blocked_ip(addr: IpAddr) -> bool {
	match addr {
		IpAddr::V4(v4) => is_blocked_v4(v4),
		IpAddr::V6(v6) => {
			if let Some(mapped) = v6.to_ipv4_mapped() {
				return is_blocked_v4(mapped);
			}
			v6_blocklist().iter().any(|net| net.contains(&v6))
		}
	}
}

fn is_blocked_v4(addr: Ipv4Addr) -> bool {
	v4_blocklist().iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_port_and_case() {
		assert_eq!(canonicalize_host("Example.COM:8443"), "example.com");
	}

	#[test]
	fn strips_trailing_dot() {
		assert_eq!(canonicalize_host("example.com."), "example.com");
	}

	#[test]
	fn unwraps_bracketed_ipv6_with_port() {
		assert_eq!(canonicalize_host("[::1]:8080"), "::1");
	}

	#[test]
	fn leaves_bare_ipv6_alone() {
		assert_eq!(canonicalize_host("2001:DB8::1"), "2001:db8::1");
	}

	#[test]
	fn blocks_loopback_and_metadata() {
		assert!(is_blocked_ip("127.0.0.1".parse().unwrap()));
		assert!(is_blocked_ip("169.254.169.254".parse().unwrap()));
		assert!(is_blocked_ip("10.0.0.5".parse().unwrap()));
		assert!(is_blocked_ip("100.64.0.1".parse().unwrap()));
		assert!(is_blocked_ip("::1".parse().unwrap()));
		assert!(is_blocked_ip("fe80::1".parse().unwrap()));
		assert!(is_blocked_ip("fc00::1".parse().unwrap()));
	}

	#[test]
	fn allows_public_addresses() {
		assert!(!is_blocked_ip("93.184.216.34".parse().unwrap()));
		assert!(!is_blocked_ip("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
	}

	#[test]
	fn blocks_ipv4_mapped_ipv6() {
		assert!(is_blocked_ip("::ffff:127.0.0.1".parse().unwrap()));
	}
}
