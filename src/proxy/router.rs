use std::collections::HashMap;

use crate::http::Method;

/// One path segment of a template: a literal or a `{var}` capture.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
	Literal(String),
	Var(String),
}

#[derive(Debug)]
struct RouteEntry<T> {
	method: Option<Method>,
	segments: Vec<Segment>,
	value: T,
}

impl<T> RouteEntry<T> {
	/// Literal segments rank above variables at the same position.
	fn specificity(&self) -> (usize, Vec<bool>) {
		(
			self.segments.len(),
			self
				.segments
				.iter()
				.map(|s| matches!(s, Segment::Literal(_)))
				.collect(),
		)
	}
}

/// Segment-wise route table with `{var}` placeholders. Tie-breaks: literal
/// segments beat variables, longer templates beat shorter ones.
#[derive(Debug, Default)]
pub struct RouteTable<T> {
	routes: Vec<RouteEntry<T>>,
}

impl<T> RouteTable<T> {
	pub fn new() -> Self {
		RouteTable { routes: Vec::new() }
	}

	/// Register a template like `/router/llm/{model}`. A `None` method
	/// matches every verb.
	pub fn add(&mut self, method: Option<Method>, template: &str, value: T) {
		let segments = template
			.trim_matches('/')
			.split('/')
			.filter(|s| !s.is_empty())
			.map(|s| {
				if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
					Segment::Var(name.to_string())
				} else {
					Segment::Literal(s.to_string())
				}
			})
			.collect();
		self.routes.push(RouteEntry {
			method,
			segments,
			value,
		});
	}

	/// Match `path`, returning the best route's value and its captured
	/// variables (decoded).
	pub fn matches(&self, method: &Method, path: &str) -> Option<(&T, HashMap<String, String>)> {
		let parts: Vec<&str> = path
			.trim_matches('/')
			.split('/')
			.filter(|s| !s.is_empty())
			.collect();

		let mut best: Option<(&RouteEntry<T>, HashMap<String, String>)> = None;
		for route in &self.routes {
			if let Some(m) = &route.method
				&& m != method
			{
				continue;
			}
			if route.segments.len() != parts.len() {
				continue;
			}
			let mut vars = HashMap::new();
			let mut ok = true;
			for (seg, part) in route.segments.iter().zip(&parts) {
				match seg {
					Segment::Literal(lit) => {
						if lit != part {
							ok = false;
							break;
						}
					},
					Segment::Var(name) => {
						let decoded = crate::client::url::decode(part, false, false)
							.unwrap_or_else(|_| (*part).to_string());
						vars.insert(name.clone(), decoded);
					},
				}
			}
			if !ok {
				continue;
			}
			let better = match &best {
				None => true,
				Some((current, _)) => route.specificity() > current.specificity(),
			};
			if better {
				best = Some((route, vars));
			}
		}
		best.map(|(route, vars)| (&route.value, vars))
	}
}
