//! HTTP header inspection stage.
//!
//! A heuristic parser: a cheap start-line probe decides whether the payload
//! can be an HTTP message at all; real header parsing is done with
//! `httparse`. Matching header signatures register hints on the flow, and
//! selected fields (URL, method, status code, configured headers) are stored
//! as flow options. Packets of flows that never look like HTTP leave on the
//! `non-http` port.

use crate::classify::hints::Hint;
use crate::config::params;
use crate::flow::Flow;
use crate::packet::PacketDescriptor;
use crate::stage::{EngineState, Ports, Stage, Verdict};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use regex::bytes::Regex;

use crate::classify::metadata::ClassificationMetadata;

const URL_OPTION_NAME: &str = "URL";
const METHOD_OPTION_NAME: &str = "Method";
const STATUS_OPTION_NAME: &str = "Status";

const REQUEST_BODY_KEY: &str = "http-request-body";
const RESPONSE_BODY_KEY: &str = "http-response-body";

const HTTP_PORT: &str = "http";
const NON_HTTP_PORT: &str = "non-http";

/// Shortest payload considered for the request probe; fits the longest
/// method name plus a one-character target.
const MIN_HTTP_REQUEST_LENGTH: usize = 16;
const MIN_HTTP_RESPONSE_LENGTH: usize = 13;

const METHODS: [&str; 8] = [
    "GET", "POST", "HEAD", "OPTIONS", "PUT", "DELETE", "TRACE", "CONNECT",
];

struct HttpSignature {
    hint: Hint,
    regex: Regex,
    capture: bool,
    pattern_name: String,
}

pub struct HttpStage {
    name: String,
    ports: Ports,
    /// The generic HTTP hint registered for every parsed message.
    http_hint: Hint,
    /// Header-name → signatures; body signatures keyed by the body keys.
    signatures: HashMap<String, Vec<HttpSignature>>,
    /// Header names carrying signatures; the runtime print list resets to
    /// this base set before extending it.
    base_headers: HashSet<String>,
    /// Headers evaluated at all (signature names plus print list).
    headers_to_process: HashSet<String>,
    headers_to_print: HashSet<String>,
    print_url: bool,
    print_method: bool,
    print_status: bool,
    max_body_size: usize,
    anonymize: bool,
    scratch: Vec<u8>,
}

impl HttpStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        metadata: &Arc<ClassificationMetadata>,
        anonymize: bool,
    ) -> Result<Self> {
        ports
            .expect_only(&[HTTP_PORT, NON_HTTP_PORT])
            .with_context(|| format!("{}: connections", name))?;

        // The generic HTTP signature anchors the http/non-http decision.
        let http_block = metadata
            .blocks()
            .get_id("HTTP")
            .ok_or_else(|| anyhow!("{}: generic HTTP block not defined in the metadata", name))?;
        let mut http_sig = None;
        let mut signatures: HashMap<String, Vec<HttpSignature>> = HashMap::new();
        let mut header_names = HashSet::new();

        for kind in ["http", "http-header", REQUEST_BODY_KEY, RESPONSE_BODY_KEY] {
            let mut error = None;
            metadata.for_each_signature(kind, |block_id, sig| {
                if error.is_some() {
                    return;
                }
                if kind == "http" {
                    if block_id == http_block {
                        http_sig = Some(sig.id);
                    }
                    return;
                }
                let key = match kind {
                    "http-header" => match sig.attr("name") {
                        Some(header) => header.to_ascii_lowercase(),
                        None => {
                            error = Some(anyhow!(
                                "signature {} of block {}: http-header without a name",
                                sig.id,
                                block_id
                            ));
                            return;
                        }
                    },
                    body => body.to_string(),
                };
                let pattern = match sig.attr("regexp") {
                    Some(p) => p,
                    None => {
                        error = Some(anyhow!(
                            "signature {} of block {}: missing regexp",
                            sig.id,
                            block_id
                        ));
                        return;
                    }
                };
                let regex = match Regex::new(pattern) {
                    Ok(r) => r,
                    Err(e) => {
                        error = Some(anyhow!(
                            "could not compile regexp \"{}\" (signature {} of block {}): {}",
                            pattern,
                            sig.id,
                            block_id,
                            e
                        ));
                        return;
                    }
                };
                let capture = sig.attr("capture") == Some("true");
                let pattern_name = sig.attr("pattern-name").unwrap_or("").to_string();
                if capture && pattern_name.is_empty() {
                    error = Some(anyhow!(
                        "capture pattern-name not specified for signature {} of block {}",
                        sig.id,
                        block_id
                    ));
                    return;
                }
                if kind == "http-header" && key != "url" {
                    header_names.insert(key.clone());
                }
                signatures.entry(key).or_default().push(HttpSignature {
                    hint: (block_id, sig.id),
                    regex,
                    capture,
                    pattern_name,
                });
            });
            if let Some(e) = error {
                bail!("{}: {}", name, e);
            }
        }

        let Some(http_sig) = http_sig else {
            bail!("{}: generic HTTP signature not defined in the metadata", name);
        };

        let mut stage = HttpStage {
            name: name.to_string(),
            ports,
            http_hint: (http_block, http_sig),
            signatures,
            base_headers: header_names.clone(),
            headers_to_process: header_names,
            headers_to_print: HashSet::new(),
            print_url: false,
            print_method: false,
            print_status: false,
            max_body_size: 20,
            anonymize,
            scratch: Vec::new(),
        };
        stage.apply_settings(settings);
        Ok(stage)
    }

    fn apply_settings(&mut self, settings: &toml::value::Table) {
        if let Some(v) = params::bool(settings, "printUrl") {
            self.print_url = v;
        }
        if let Some(v) = params::bool(settings, "printHttpMethod") {
            self.print_method = v;
        }
        if let Some(v) = params::bool(settings, "printStatusCode") {
            self.print_status = v;
        }
        if let Some(list) = params::str(settings, "httpHeadersToPrint") {
            self.headers_to_print.clear();
            self.headers_to_process = self.base_headers.clone();
            for header in list.split_whitespace() {
                let header = header.to_ascii_lowercase();
                self.headers_to_print.insert(header.clone());
                self.headers_to_process.insert(header);
            }
            log::info!(
                "{}: printing HTTP headers: {}",
                self.name,
                list.to_ascii_lowercase()
            );
        }
        if let Some(size) = params::usize(settings, "maxBodySize") {
            self.max_body_size = size;
            log::info!("{}: parsing {} bytes from HTTP bodies", self.name, size);
        }
    }

    fn seems_request(payload: &[u8]) -> bool {
        if payload.len() < MIN_HTTP_REQUEST_LENGTH {
            return false;
        }
        let head = &payload[..MIN_HTTP_REQUEST_LENGTH];
        let Some(space) = head.iter().position(|b| *b == b' ') else {
            return false;
        };
        METHODS.iter().any(|m| m.as_bytes() == &head[..space])
    }

    fn seems_response(payload: &[u8]) -> bool {
        payload.len() >= MIN_HTTP_RESPONSE_LENGTH && payload.starts_with(b"HTTP/")
    }

    /// Registers an option value, truncating at the query separator when
    /// anonymisation is on.
    fn register_option(&self, flow: &mut Flow, name: &str, value: &str) {
        if self.anonymize {
            if let Some(pos) = value.find('?') {
                flow.options_mut()
                    .register(name, &value[..pos + 1], true, false, crate::flow::OPTION_SEPARATOR);
                return;
            }
            if let Some(pos) = value.find("%3F") {
                flow.options_mut()
                    .register(name, &value[..pos + 3], true, false, crate::flow::OPTION_SEPARATOR);
                return;
            }
        }
        flow.options_mut()
            .register(name, value, true, false, crate::flow::OPTION_SEPARATOR);
    }

    fn run_signatures(&self, key: &str, value: &[u8], flow: &mut Flow) {
        let Some(signatures) = self.signatures.get(key) else {
            return;
        };
        for sig in signatures {
            if sig.capture {
                if let Some(captures) = sig.regex.captures(value) {
                    flow.set_hint(sig.hint.0, sig.hint.1);
                    let captured = captures
                        .get(1)
                        .or_else(|| captures.get(0))
                        .map(|m| m.as_bytes())
                        .unwrap_or_default();
                    self.register_option(
                        flow,
                        &sig.pattern_name,
                        &String::from_utf8_lossy(captured),
                    );
                }
            } else if sig.regex.is_match(value) {
                flow.set_hint(sig.hint.0, sig.hint.1);
            }
        }
    }

    fn process_header(&self, header_name: &str, value: &[u8], flow: &mut Flow) {
        if !self.headers_to_process.contains(header_name) {
            return;
        }
        self.run_signatures(header_name, value, flow);
        if self.headers_to_print.contains(header_name) {
            self.register_option(flow, header_name, &String::from_utf8_lossy(value));
        }
    }

    /// Parses one TCP payload as an HTTP message. Returns false when the
    /// payload does not look like an HTTP start line after all.
    fn parse_http_message(&mut self, payload: &[u8], packet_no: u64, flow: &mut Flow) -> bool {
        let is_response = Self::seems_response(payload);
        let is_request = !is_response && Self::seems_request(payload);
        if !is_request && !is_response {
            return false;
        }

        // httparse needs the empty line terminating the header block; when
        // the headers continue in the next packet, parse the complete lines
        // seen so far and skip the body.
        let headers_end = find(payload, b"\r\n\r\n");
        let parse_buf: &[u8] = match headers_end {
            Some(end) => &payload[..end + 4],
            None => {
                let Some(last_line) = rfind(payload, b"\r\n") else {
                    log::debug!(
                        "{}: HTTP start line without line terminator (no. {})",
                        self.name,
                        packet_no
                    );
                    return false;
                };
                self.scratch.clear();
                self.scratch.extend_from_slice(&payload[..last_line + 2]);
                self.scratch.extend_from_slice(b"\r\n");
                &self.scratch
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed: Vec<(String, Vec<u8>)> = Vec::new();
        // (method and URL of a request, status code of a response)
        let start_line: (Option<String>, Option<String>);

        if is_request {
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(parse_buf) {
                Ok(httparse::Status::Complete(_)) => {}
                Ok(httparse::Status::Partial) | Err(_) => {
                    log::debug!(
                        "{}: payload looked like an HTTP request but does not parse (no. {})",
                        self.name,
                        packet_no
                    );
                    return false;
                }
            }
            start_line = (
                match (req.method, req.path) {
                    (Some(m), Some(p)) => Some(format!("{} {}", m, p)),
                    _ => None,
                },
                None,
            );
            for header in req.headers.iter() {
                parsed.push((header.name.to_ascii_lowercase(), header.value.to_vec()));
            }
        } else {
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(parse_buf) {
                Ok(httparse::Status::Complete(_)) => {}
                Ok(httparse::Status::Partial) | Err(_) => {
                    log::debug!(
                        "{}: payload looked like an HTTP response but does not parse (no. {})",
                        self.name,
                        packet_no
                    );
                    return false;
                }
            }
            start_line = (None, resp.code.map(|c| c.to_string()));
            for header in resp.headers.iter() {
                parsed.push((header.name.to_ascii_lowercase(), header.value.to_vec()));
            }
        }

        // The message parses: it is HTTP regardless of signature matches.
        flow.set_hint(self.http_hint.0, self.http_hint.1);

        let (request, status) = start_line;
        if let Some(request) = request {
            let (method, url) = request.split_once(' ').unwrap_or((request.as_str(), ""));
            self.run_signatures("url", url.as_bytes(), flow);
            if self.print_method {
                self.register_option(flow, METHOD_OPTION_NAME, method);
            }
            if self.print_url {
                self.register_option(flow, URL_OPTION_NAME, url);
            }
        }
        if let Some(status) = status {
            if self.print_status {
                self.register_option(flow, STATUS_OPTION_NAME, &status);
            }
        }

        for (name, value) in &parsed {
            self.process_header(name, value, flow);
        }

        if let Some(end) = headers_end {
            let body = &payload[end + 4..];
            let body = &body[..body.len().min(self.max_body_size)];
            if !body.is_empty() {
                let key = if is_response {
                    RESPONSE_BODY_KEY
                } else {
                    REQUEST_BODY_KEY
                };
                self.run_signatures(key, body, flow);
            }
        }

        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

impl Stage for HttpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let Some(flow) = packet.flow().cloned() else {
            log::warn!(
                "{}: no flow associated with packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return self.ports.forward_default();
        };

        let mut flow = flow.borrow_mut();
        let packet_no = packet.packet_number();
        let mut is_http = self.parse_http_message(packet.payload(), packet_no, &mut flow);
        if !is_http {
            // Continuation packets of a flow already identified as HTTP stay
            // on the HTTP path.
            is_http = flow.hints().contains(self.http_hint.0, self.http_hint.1);
        }

        let port = if is_http { HTTP_PORT } else { NON_HTTP_PORT };
        match self.ports.named(port) {
            Some(handle) => Verdict::Forward(handle),
            None => self.ports.forward_default(),
        }
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        self.apply_settings(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::metadata::tests::test_metadata;
    use crate::flow::FlowId;
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::stage::StageHandle;
    use crate::time::TimeVal;
    use std::cell::RefCell;
    use std::rc::Rc;

    const GET: &[u8] = b"GET /index.html?user=a HTTP/1.1\r\nHost: a\r\nUser-Agent: curl\r\n\r\n";

    fn stage(anonymize: bool) -> HttpStage {
        let metadata = Arc::new(test_metadata());
        let mut settings = toml::value::Table::new();
        settings.insert("printUrl".into(), toml::Value::Boolean(true));
        settings.insert("printStatusCode".into(), toml::Value::Boolean(true));
        let ports = Ports::new(
            None,
            vec![
                (HTTP_PORT.to_string(), StageHandle::for_tests(7)),
                (NON_HTTP_PORT.to_string(), StageHandle::for_tests(8)),
            ],
        );
        HttpStage::new("http", &settings, ports, &metadata, anonymize).unwrap()
    }

    fn packet_with_flow(payload: &[u8]) -> (PacketDescriptor, crate::flow::FlowRef) {
        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(100, 0),
                caplen: payload.len() as u32,
                origlen: payload.len() as u32,
            },
            payload,
            1,
        );
        let flow = Rc::new(RefCell::new(crate::flow::Flow::new(
            FlowId::default(),
            Arc::new(test_metadata()),
        )));
        packet.set_flow(Rc::clone(&flow));
        (packet, flow)
    }

    #[test]
    fn get_request_registers_hint_and_url() {
        let mut http = stage(false);
        let (mut packet, flow) = packet_with_flow(GET);
        let verdict = http.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(7)));

        let flow = flow.borrow();
        assert!(flow.hints().contains(1, 1), "generic HTTP hint");
        assert!(flow.hints().contains(1, 2), "user-agent signature matched");
        assert_eq!(flow.options().get("URL"), Some("/index.html?user=a"));
    }

    #[test]
    fn anonymisation_truncates_at_query() {
        let mut http = stage(true);
        let (mut packet, flow) = packet_with_flow(GET);
        http.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(flow.borrow().options().get("URL"), Some("/index.html?"));
    }

    #[test]
    fn response_status_code_option() {
        let mut http = stage(false);
        let (mut packet, flow) =
            packet_with_flow(b"HTTP/1.1 404 Not Found\r\nServer: x\r\n\r\n");
        let verdict = http.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(7)));
        assert_eq!(flow.borrow().options().get("Status"), Some("404"));
    }

    #[test]
    fn non_http_routes_away_until_flow_is_hinted() {
        let mut http = stage(false);
        let (mut packet, flow) = packet_with_flow(b"\x16\x03\x01 not http at all....");
        let verdict = http.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(8)));

        // Once the flow carries the generic hint, continuation data stays on
        // the HTTP path.
        flow.borrow_mut().set_hint(1, 1);
        let (mut packet, _) = packet_with_flow(b"continuation bytes without structure");
        packet.set_flow(flow);
        let verdict = http.process_packet(&mut packet, &mut tests_support::state());
        assert_eq!(verdict, Verdict::Forward(StageHandle::for_tests(7)));
    }

    #[test]
    fn incomplete_header_block_still_hints() {
        let mut http = stage(false);
        let (mut packet, flow) =
            packet_with_flow(b"GET / HTTP/1.1\r\nHost: a\r\nUser-Agent: cu");
        http.process_packet(&mut packet, &mut tests_support::state());
        let flow = flow.borrow();
        assert!(flow.hints().contains(1, 1));
        assert!(!flow.hints().contains(1, 2), "truncated header line is not matched");
    }
}
