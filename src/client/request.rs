use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use super::body::{
	BodyType, FilePart, FileSource, Part, ProgressCallback, ProgressStep, RequestBodySpec,
};
use super::url::Url;
use super::{ClientError, HttpClient};
use crate::client::call::Call;
use crate::http::{HeaderMap, HeaderName, HeaderValue, Method};

/// An explicitly-set request body, mutually exclusive with body/file params.
#[derive(Debug, Clone)]
pub enum BodyPara {
	Bytes(Bytes),
	Text(String),
	Value(serde_json::Value),
}

/// Fluent assembly of one HTTP call: URL template substitution, query/body
/// parameter collection, body-type serialization, progress hooks.
#[derive(Clone)]
pub struct RequestBuilder {
	client: HttpClient,
	method: Method,
	url_template: String,
	headers: HeaderMap,
	path_params: HashMap<String, String>,
	url_params: Vec<(String, String)>,
	body_params: Vec<(String, String)>,
	file_params: Vec<FilePart>,
	body_over: Option<BodyPara>,
	body_type: BodyType,
	charset: String,
	tag: Option<String>,
	range: Option<(u64, Option<u64>)>,
	progress: Option<(ProgressCallback, ProgressStep)>,
	nothrow: bool,
	skip_preproc: bool,
	skip_serial_preproc: bool,
	timeout: Option<Duration>,
}

impl RequestBuilder {
	pub(crate) fn new(client: HttpClient, method: Method, url_template: &str) -> Self {
		RequestBuilder {
			client,
			method,
			url_template: url_template.to_string(),
			headers: HeaderMap::new(),
			path_params: HashMap::new(),
			url_params: Vec::new(),
			body_params: Vec::new(),
			file_params: Vec::new(),
			body_over: None,
			body_type: BodyType::default(),
			charset: "utf-8".to_string(),
			tag: None,
			range: None,
			progress: None,
			nothrow: false,
			skip_preproc: false,
			skip_serial_preproc: false,
			timeout: None,
		}
	}

	pub fn add_header(mut self, name: &str, value: &str) -> Result<Self, ClientError> {
		let name: HeaderName = name
			.parse()
			.map_err(|_| ClientError::Config(format!("invalid header name: {name}")))?;
		let value: HeaderValue = value
			.parse()
			.map_err(|_| ClientError::Config(format!("invalid header value for {name}")))?;
		self.headers.append(name, value);
		Ok(self)
	}

	/// Substitute `{name}` in the URL template.
	pub fn add_path_para(mut self, name: &str, value: &str) -> Self {
		self.path_params.insert(name.to_string(), value.to_string());
		self
	}

	/// Append a query parameter.
	pub fn add_url_para(mut self, name: &str, value: &str) -> Self {
		self.url_params.push((name.to_string(), value.to_string()));
		self
	}

	pub fn add_body_para(mut self, name: &str, value: &str) -> Self {
		self.body_params.push((name.to_string(), value.to_string()));
		self
	}

	pub fn add_file_para(mut self, name: &str, filename: &str, content_type: &str, source: FileSource) -> Self {
		self.file_params.push(FilePart {
			name: name.to_string(),
			filename: filename.to_string(),
			content_type: content_type.to_string(),
			source,
		});
		self
	}

	/// Set the whole body at once. Conflicts with `add_body_para`/`add_file_para`.
	pub fn set_body_para(mut self, body: BodyPara) -> Self {
		self.body_over = Some(body);
		self
	}

	pub fn body_type(mut self, body_type: BodyType) -> Self {
		self.body_type = body_type;
		self
	}

	pub fn charset(mut self, charset: &str) -> Self {
		self.charset = charset.to_string();
		self
	}

	pub fn tag(mut self, tag: &str) -> Self {
		self.tag = Some(tag.to_string());
		self
	}

	pub fn set_range(mut self, start: u64, end: Option<u64>) -> Self {
		self.range = Some((start, end));
		self
	}

	pub fn set_on_process(mut self, callback: ProgressCallback, step: ProgressStep) -> Self {
		self.progress = Some((callback, step));
		self
	}

	/// Failures surface on the call result instead of being logged as errors.
	pub fn nothrow(mut self) -> Self {
		self.nothrow = true;
		self
	}

	pub fn skip_preproc(mut self) -> Self {
		self.skip_preproc = true;
		self.skip_serial_preproc = true;
		self
	}

	pub fn skip_serial_preproc(mut self) -> Self {
		self.skip_serial_preproc = true;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Resolve the template and body rules into an immutable prepared request.
	pub fn build(self) -> Result<PreparedRequest, ClientError> {
		let url_str = substitute_path_params(&self.url_template, &self.path_params)?;
		let url = Url::parse(&url_str).map_err(ClientError::Url)?;
		let url = if self.url_params.is_empty() {
			url
		} else {
			let mut b = url.new_builder();
			for (name, value) in &self.url_params {
				b = b.add_query_parameter(name, Some(value));
			}
			b.build().map_err(ClientError::Url)?
		};

		let body = self.select_body()?;

		let mut headers = self.headers;
		if let Some((start, end)) = self.range {
			let value = match end {
				Some(end) => format!("bytes={start}-{end}"),
				None => format!("bytes={start}-"),
			};
			headers.insert(
				crate::http::header::RANGE,
				HeaderValue::try_from(value)
					.map_err(|_| ClientError::Config("invalid range".to_string()))?,
			);
		}

		Ok(PreparedRequest {
			url,
			method: self.method,
			headers,
			body,
			tag: self.tag,
			timeout: self.timeout,
			nothrow: self.nothrow,
			skip_preproc: self.skip_preproc,
			skip_serial_preproc: self.skip_serial_preproc,
			progress: self.progress,
		})
	}

	/// Build and wrap into an executable call.
	pub fn new_call(self) -> Result<Call, ClientError> {
		let client = self.client.clone();
		let prepared = self.build()?;
		Ok(client.new_call(prepared))
	}

	fn select_body(&self) -> Result<RequestBodySpec, ClientError> {
		let has_params = !self.body_params.is_empty() || !self.file_params.is_empty();
		if self.body_over.is_some() && has_params {
			return Err(ClientError::Config(
				"set_body_para conflicts with add_body_para/add_file_para".to_string(),
			));
		}
		let wants_body = self.body_over.is_some() || has_params;
		match self.method {
			Method::GET | Method::HEAD if wants_body => {
				return Err(ClientError::Config(format!(
					"{} request must not carry a body",
					self.method
				)));
			},
			Method::DELETE if has_params => {
				return Err(ClientError::Config(
					"DELETE request must not carry body params".to_string(),
				));
			},
			_ => {},
		}

		if !self.file_params.is_empty() {
			let mut parts: Vec<Part> = self
				.body_params
				.iter()
				.map(|(name, value)| Part::Field {
					name: name.clone(),
					value: value.clone(),
				})
				.collect();
			parts.extend(self.file_params.iter().cloned().map(Part::File));
			return Ok(RequestBodySpec::Multipart { parts });
		}

		if let Some(over) = &self.body_over {
			let (data, content_type) = match over {
				BodyPara::Bytes(b) => (b.clone(), self.body_type.media_type(&self.charset)),
				BodyPara::Text(s) => (
					Bytes::from(s.clone()),
					self.body_type.media_type(&self.charset),
				),
				BodyPara::Value(v) => (
					self.body_type.serialize_value(v)?,
					self.body_type.media_type(&self.charset),
				),
			};
			return Ok(RequestBodySpec::Bytes { data, content_type });
		}

		if !self.body_params.is_empty() {
			let data = self.body_type.serialize_params(&self.body_params)?;
			return Ok(RequestBodySpec::Bytes {
				data,
				content_type: self.body_type.media_type(&self.charset),
			});
		}

		Ok(RequestBodySpec::Empty)
	}
}

/// Replace `{name}` tokens; a token with no matching parameter is an error.
fn substitute_path_params(
	template: &str,
	params: &HashMap<String, String>,
) -> Result<String, ClientError> {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;
	while let Some(open) = rest.find('{') {
		out.push_str(&rest[..open]);
		let after = &rest[open + 1..];
		let close = after.find('}').ok_or_else(|| {
			ClientError::Config(format!("unterminated path token in template: {template}"))
		})?;
		let name = &after[..close];
		let value = params.get(name).ok_or_else(|| {
			ClientError::Config(format!("unresolved path parameter {{{name}}}"))
		})?;
		out.push_str(&super::url::encode(value, super::url::PATH_SEGMENT));
		rest = &after[close + 1..];
	}
	out.push_str(rest);
	Ok(out)
}

/// An immutable, fully-resolved request ready for execution.
#[derive(Clone)]
pub struct PreparedRequest {
	pub url: Url,
	pub method: Method,
	pub headers: HeaderMap,
	pub body: RequestBodySpec,
	pub tag: Option<String>,
	pub timeout: Option<Duration>,
	pub nothrow: bool,
	pub skip_preproc: bool,
	pub skip_serial_preproc: bool,
	pub progress: Option<(ProgressCallback, ProgressStep)>,
}

impl std::fmt::Debug for PreparedRequest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PreparedRequest")
			.field("url", &self.url.to_string())
			.field("method", &self.method)
			.field("tag", &self.tag)
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::HttpClient;

	fn client() -> HttpClient {
		HttpClient::builder().build()
	}

	fn builder(method: Method, url: &str) -> RequestBuilder {
		RequestBuilder::new(client(), method, url)
	}

	#[test]
	fn path_substitution() {
		let p = builder(Method::GET, "http://a.com/users/{id}/files/{name}")
			.add_path_para("id", "42")
			.add_path_para("name", "a b")
			.build()
			.unwrap();
		assert_eq!(p.url.to_string(), "http://a.com/users/42/files/a%20b");
	}

	#[test]
	fn leftover_token_is_fatal() {
		let err = builder(Method::GET, "http://a.com/users/{id}")
			.build()
			.unwrap_err();
		assert!(matches!(err, ClientError::Config(_)));
	}

	#[test]
	fn url_params_become_query() {
		let p = builder(Method::GET, "http://a.com/x")
			.add_url_para("q", "1")
			.add_url_para("r", "two words")
			.build()
			.unwrap();
		assert_eq!(p.url.to_string(), "http://a.com/x?q=1&r=two%20words");
	}

	#[test]
	fn body_rules_select_multipart_over_everything() {
		let p = builder(Method::POST, "http://a.com/u")
			.add_body_para("k", "v")
			.add_file_para(
				"f",
				"a.txt",
				"text/plain",
				FileSource::Bytes(Bytes::from_static(b"AB")),
			)
			.build()
			.unwrap();
		match p.body {
			RequestBodySpec::Multipart { parts } => assert_eq!(parts.len(), 2),
			other => panic!("expected multipart, got {other:?}"),
		}
	}

	#[test]
	fn set_body_conflicts_with_params() {
		let err = builder(Method::POST, "http://a.com/u")
			.add_body_para("k", "v")
			.set_body_para(BodyPara::Text("x".to_string()))
			.build()
			.unwrap_err();
		assert!(matches!(err, ClientError::Config(_)));
	}

	#[test]
	fn get_with_body_is_fatal() {
		let err = builder(Method::GET, "http://a.com/u")
			.add_body_para("k", "v")
			.build()
			.unwrap_err();
		assert!(matches!(err, ClientError::Config(_)));
	}

	#[test]
	fn delete_allows_explicit_body_only() {
		let ok = builder(Method::DELETE, "http://a.com/u")
			.set_body_para(BodyPara::Text("x".to_string()))
			.build();
		assert!(ok.is_ok());
		let err = builder(Method::DELETE, "http://a.com/u")
			.add_body_para("k", "v")
			.build()
			.unwrap_err();
		assert!(matches!(err, ClientError::Config(_)));
	}

	#[test]
	fn body_params_serialize_by_type() {
		let p = builder(Method::POST, "http://a.com/u")
			.body_type(BodyType::Form)
			.add_body_para("a", "1")
			.build()
			.unwrap();
		match p.body {
			RequestBodySpec::Bytes { data, content_type } => {
				assert_eq!(&data[..], b"a=1");
				assert!(content_type.starts_with("application/x-www-form-urlencoded"));
			},
			other => panic!("unexpected body {other:?}"),
		}

		let p = builder(Method::POST, "http://a.com/u")
			.add_body_para("a", "1")
			.build()
			.unwrap();
		match p.body {
			RequestBodySpec::Bytes { data, content_type } => {
				assert_eq!(&data[..], br#"{"a":"1"}"#);
				assert!(content_type.starts_with("application/json"));
			},
			other => panic!("unexpected body {other:?}"),
		}
	}

	#[test]
	fn range_header() {
		let p = builder(Method::GET, "http://a.com/f")
			.set_range(100, Some(199))
			.build()
			.unwrap();
		assert_eq!(
			p.headers.get(crate::http::header::RANGE).unwrap(),
			"bytes=100-199"
		);
	}
}
