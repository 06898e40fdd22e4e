use std::net::SocketAddr;

use super::url::Url;

/// How to reach an origin before any DNS resolution has happened.
/// Structural equality keys the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
	pub host: String,
	pub port: u16,
	pub tls: bool,
}

impl Address {
	pub fn from_url(url: &Url) -> Address {
		Address {
			host: url.host().to_string(),
			port: url.port(),
			tls: url.is_https(),
		}
	}

	/// The SNI / Host header form, without brackets stripping for IPv6.
	pub fn host_header(&self) -> String {
		let default = if self.tls { 443 } else { 80 };
		if self.port == default {
			self.host.clone()
		} else {
			format!("{}:{}", self.host, self.port)
		}
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}://{}:{}",
			if self.tls { "https" } else { "http" },
			self.host,
			self.port
		)
	}
}

/// An upstream proxy hop. Only direct connections and HTTP CONNECT-less
/// forward proxies are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Proxy {
	#[default]
	Direct,
	Http(SocketAddr),
}

/// One concrete connection candidate: the Address, the proxy decision, and a
/// resolved socket address. Resolution of one Address yields several Routes;
/// connect failures advance to the next.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
	pub address: Address,
	pub proxy: Proxy,
	pub socket_addr: SocketAddr,
}

impl Route {
	/// Where to actually dial: the proxy if one is set, the origin otherwise.
	pub fn dial_addr(&self) -> SocketAddr {
		match self.proxy {
			Proxy::Direct => self.socket_addr,
			Proxy::Http(p) => p,
		}
	}
}
