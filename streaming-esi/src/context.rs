use std::collections::HashMap;
use std::net::IpAddr;

use fastly::http::{header, Url};
use fastly::Request;
use log::trace;
use percent_encoding::percent_decode_str;

use crate::variables::{CustomVariables, VariableLookup};

const CLIENT_IP_HEADER: &str = "Fastly-Client-IP";
const ESI_ARG_PREFIX: &str = "esi_";

/// Per-request state that ESI processing reads from.
///
/// An `EventContext` is built once for the client request and once more for every fragment
/// that gets processed, each with its own recursion level.
pub struct EventContext {
    request: Request,
    headers: HashMap<String, String>,
    esi_args: EsiArgs,
    client_ip: Option<IpAddr>,
    level: u32,
    cookie_blacklist: Vec<String>,
    custom_variables: CustomVariables,
}

#[derive(Debug, Default)]
struct EsiArgs {
    // `esi_a=1&esi_b=2`, as it appeared in the URL
    serialized: String,
    // decoded pairs, prefix kept on the name
    pairs: Vec<(String, String)>,
}

impl EventContext {
    /// Captures the request's variables and strips `esi_` arguments from its URL.
    pub fn new(
        request: &mut Request,
        level: u32,
        cookie_blacklist: Vec<String>,
        custom_variables: CustomVariables,
    ) -> Self {
        let mut url = request.get_url().clone();
        let esi_args = split_esi_args(&mut url);
        if !esi_args.pairs.is_empty() {
            trace!("removed esi args `{}` from {}", esi_args.serialized, url);
            request.set_url(url);
        }

        let client_ip = request
            .get_header(CLIENT_IP_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok());

        Self {
            headers: normalize_headers(request),
            request: request.clone_without_body(),
            esi_args,
            client_ip,
            level,
            cookie_blacklist,
            custom_variables,
        }
    }

    /// The request as it is forwarded, without `esi_` arguments.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn url(&self) -> &Url {
        self.request.get_url()
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn is_blacklisted_cookie(&self, name: &str) -> bool {
        self.cookie_blacklist.iter().any(|blocked| blocked == name)
    }

    fn query_string(&self, key: Option<&str>, default: &str) -> String {
        let url = self.url();
        match key {
            None => match url.query() {
                Some(query) if !query.is_empty() => query.to_string(),
                _ => default.to_string(),
            },
            Some(key) => {
                let values: Vec<String> = url
                    .query_pairs()
                    .filter(|(name, _)| name == key)
                    .map(|(_, value)| value.into_owned())
                    .collect();
                join_or_default(&values, default)
            }
        }
    }

    fn cookie(&self, key: Option<&str>, default: &str) -> String {
        let cookies = parse_cookies(self.header("COOKIE").unwrap_or_default());
        match key {
            None => cookies
                .iter()
                .filter(|(name, _)| !self.is_blacklisted_cookie(name))
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
            Some(key) if self.is_blacklisted_cookie(key) => default.to_string(),
            Some(key) => cookies
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| decode_cookie_value(value))
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string()),
        }
    }

    fn esi_arg(&self, key: Option<&str>, default: &str) -> String {
        match key {
            _ if self.esi_args.pairs.is_empty() => default.to_string(),
            None => self.esi_args.serialized.clone(),
            Some(key) => {
                let values: Vec<String> = self
                    .esi_args
                    .pairs
                    .iter()
                    .filter(|(name, _)| name.strip_prefix(ESI_ARG_PREFIX) == Some(key))
                    .map(|(_, value)| value.clone())
                    .collect();
                join_or_default(&values, default)
            }
        }
    }
}

impl VariableLookup for EventContext {
    fn lookup(&self, name: &str, key: Option<&str>, default: &str) -> String {
        if let Some(custom) = self.custom_variables.get(name) {
            return custom.resolve(key).unwrap_or(default).to_string();
        }
        match name {
            "QUERY_STRING" => self.query_string(key, default),
            "ESI_ARGS" => self.esi_arg(key, default),
            "HTTP_COOKIE" => self.cookie(key, default),
            _ => match name.strip_prefix("HTTP_") {
                Some(header_name) => match (self.header(header_name), key) {
                    (Some(value), Some(lang)) if header_name == "ACCEPT_LANGUAGE" => {
                        value.contains(lang).to_string()
                    }
                    (Some(value), _) => value.to_string(),
                    (None, _) => default.to_string(),
                },
                None => default.to_string(),
            },
        }
    }
}

fn join_or_default(values: &[String], default: &str) -> String {
    if values.is_empty() {
        default.to_string()
    } else {
        values.join(", ")
    }
}

// Header names become `ACCEPT_LANGUAGE` style keys. Repeated headers are joined.
fn normalize_headers(request: &Request) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for name in request.get_header_names() {
        let separator = if name == header::COOKIE { "; " } else { ", " };
        let values: Vec<&str> = request
            .get_header_all(name)
            .filter_map(|value| value.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        let key = name.as_str().to_ascii_uppercase().replace('-', "_");
        headers.insert(key, values.join(separator));
    }
    headers
}

fn parse_cookies(header: &str) -> Vec<(&str, &str)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name, value.trim()))
        })
        .collect()
}

// Quoted values lose their quotes; percent-escapes are decoded when they form valid UTF-8.
fn decode_cookie_value(raw: &str) -> String {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'))
        .unwrap_or(raw);
    percent_decode_str(unquoted)
        .decode_utf8()
        .map_or_else(|_| unquoted.to_string(), |value| value.into_owned())
}

fn is_esi_arg(segment: &str) -> bool {
    segment
        .strip_prefix(ESI_ARG_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('='))
}

// Moves `esi_*` query arguments out of `url`. The remaining arguments keep their original
// encoding and order.
fn split_esi_args(url: &mut Url) -> EsiArgs {
    let Some(query) = url.query() else {
        return EsiArgs::default();
    };
    let (esi, kept): (Vec<&str>, Vec<&str>) = query.split('&').partition(|s| is_esi_arg(s));
    if esi.is_empty() {
        return EsiArgs::default();
    }
    let serialized = esi.join("&");
    let kept = kept.join("&");
    let pairs = url
        .query_pairs()
        .filter(|(name, _)| is_esi_arg(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    url.set_query(if kept.is_empty() { None } else { Some(&kept) });
    EsiArgs { serialized, pairs }
}
