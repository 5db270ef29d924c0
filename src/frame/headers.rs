use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{uri, Method, StatusCode, Uri};
use std::fmt;

use crate::frame::{util, Error, Frame, StreamDependency, StreamId};

#[derive(Eq, PartialEq, Clone)]
pub struct Headers {
    stream_id: StreamId,

    stream_dep: Option<StreamDependency>,

    pseudo: Pseudo,

    fields: HeaderMap,

    flags: HeadersFlag,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct HeadersFlag(u8);

#[derive(Eq, PartialEq, Clone)]
pub struct PushPromise {
    stream_id: StreamId,

    promised_id: StreamId,

    pseudo: Pseudo,

    fields: HeaderMap,
}

/// The request/response metadata carried in pseudo-header fields.
///
/// The set is exactly `{:method, :scheme, :authority, :path, :status}`.
/// Holding each as a dedicated option enforces "at most one value each"
/// and "pseudo-headers precede regular fields" structurally.
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct Pseudo {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,

    pub status: Option<StatusCode>,
}

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;
const ALL: u8 = END_STREAM | END_HEADERS | PADDED | PRIORITY;

impl Headers {
    pub fn new(stream_id: StreamId, pseudo: Pseudo, fields: HeaderMap) -> Self {
        Headers {
            stream_id,
            stream_dep: None,
            pseudo,
            fields,
            flags: HeadersFlag::default(),
        }
    }

    pub fn trailers(stream_id: StreamId, fields: HeaderMap) -> Self {
        let mut flags = HeadersFlag::default();
        flags.set_end_stream();

        Headers {
            stream_id,
            stream_dep: None,
            pseudo: Pseudo::default(),
            fields,
            flags,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.is_end_stream()
    }

    pub fn set_end_stream(&mut self) {
        self.flags.set_end_stream()
    }

    pub fn is_trailers(&self) -> bool {
        self.pseudo == Pseudo::default()
    }

    pub fn stream_dep(&self) -> Option<&StreamDependency> {
        self.stream_dep.as_ref()
    }

    pub fn set_stream_dep(&mut self, dep: StreamDependency) {
        self.flags.set_priority();
        self.stream_dep = Some(dep);
    }

    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    pub fn into_parts(self) -> (Pseudo, HeaderMap) {
        (self.pseudo, self.fields)
    }
}

impl From<Headers> for Frame {
    fn from(src: Headers) -> Self {
        Frame::Headers(src)
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Headers");
        builder
            .field("stream_id", &self.stream_id)
            .field("flags", &self.flags);

        if let Some(ref dep) = self.stream_dep {
            builder.field("stream_dep", dep);
        }

        builder.finish()
    }
}

impl PushPromise {
    pub fn new(
        stream_id: StreamId,
        promised_id: StreamId,
        pseudo: Pseudo,
        fields: HeaderMap,
    ) -> Self {
        PushPromise {
            stream_id,
            promised_id,
            pseudo,
            fields,
        }
    }

    /// A pushed request must be safe and cacheable and carry no body.
    pub fn validate_request(pseudo: &Pseudo, fields: &HeaderMap) -> Result<(), Error> {
        if let Some(content_length) = fields.get(http::header::CONTENT_LENGTH) {
            if content_length.as_bytes() != b"0" {
                return Err(Error::MalformedMessage);
            }
        }
        match pseudo.method {
            Some(ref method) if *method == Method::GET || *method == Method::HEAD => Ok(()),
            _ => Err(Error::MalformedMessage),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn promised_id(&self) -> StreamId {
        self.promised_id
    }

    pub fn pseudo(&self) -> &Pseudo {
        &self.pseudo
    }

    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    pub fn into_parts(self) -> (Pseudo, HeaderMap) {
        (self.pseudo, self.fields)
    }
}

impl From<PushPromise> for Frame {
    fn from(src: PushPromise) -> Self {
        Frame::PushPromise(src)
    }
}

impl fmt::Debug for PushPromise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PushPromise")
            .field("stream_id", &self.stream_id)
            .field("promised_id", &self.promised_id)
            .finish()
    }
}

impl Pseudo {
    pub fn request(method: Method, uri: Uri) -> Self {
        let parts = uri::Parts::from(uri);

        let mut path = parts
            .path_and_query
            .map(|v| v.as_str().to_string())
            .unwrap_or_default();

        if path.is_empty() && method != Method::OPTIONS {
            path = "/".to_string();
        }

        let mut pseudo = Pseudo {
            method: Some(method),
            scheme: None,
            authority: None,
            path: Some(path),
            status: None,
        };

        if let Some(scheme) = parts.scheme {
            pseudo.scheme = Some(scheme.as_str().to_string());
        }

        if let Some(authority) = parts.authority {
            pseudo.authority = Some(authority.as_str().to_string());
        }

        pseudo
    }

    pub fn response(status: StatusCode) -> Self {
        Pseudo {
            method: None,
            scheme: None,
            authority: None,
            path: None,
            status: Some(status),
        }
    }
}

/// Whether a header is connection-specific and therefore forbidden in
/// HTTP/2 messages.
pub fn is_connection_level(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "host" | "upgrade"
    )
}

/// Prepares caller-supplied fields for transmission: connection-specific
/// headers are stripped, `cookie` values are split into crumbs so HPACK
/// can index them, and a `te` other than `trailers` is rejected.
pub fn sanitize_fields(fields: HeaderMap) -> Result<HeaderMap, Error> {
    let mut out = HeaderMap::with_capacity(fields.len());
    let mut last_name: Option<HeaderName> = None;

    for (name, value) in fields {
        let name = match name {
            Some(name) => {
                last_name = Some(name.clone());
                name
            }
            None => last_name.clone().expect("first entry carries its name"),
        };

        if is_connection_level(&name) {
            tracing::trace!("dropping connection level header; name={:?}", name);
            continue;
        }

        if name == http::header::TE && !value_is_trailers(&value) {
            return Err(Error::MalformedMessage);
        }

        if name == http::header::COOKIE {
            append_cookie(&mut out, &value)?;
            continue;
        }

        out.append(name, value);
    }

    Ok(out)
}

/// Validates received fields the way the sender-side sanitizer would
/// have: connection-specific headers and a non-`trailers` `te` make the
/// message malformed.
pub fn check_fields(fields: &HeaderMap) -> Result<(), Error> {
    for (name, value) in fields {
        if is_connection_level(name) {
            tracing::trace!("received connection level header; name={:?}", name);
            return Err(Error::MalformedMessage);
        }

        if *name == http::header::TE && !value_is_trailers(value) {
            tracing::trace!("received TE header not set to trailers; val={:?}", value);
            return Err(Error::MalformedMessage);
        }
    }

    Ok(())
}

fn value_is_trailers(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|v| v.eq_ignore_ascii_case("trailers"))
        .unwrap_or(false)
}

fn append_cookie(out: &mut HeaderMap, value: &HeaderValue) -> Result<(), Error> {
    let raw = value.to_str().map_err(|_| Error::MalformedMessage)?;

    if !raw.contains(';') {
        out.append(http::header::COOKIE, value.clone());
        return Ok(());
    }

    for crumb in raw.split(';') {
        let crumb = crumb.trim();
        if crumb.is_empty() {
            continue;
        }
        let crumb = HeaderValue::from_str(crumb).map_err(|_| Error::MalformedMessage)?;
        out.append(http::header::COOKIE, crumb);
    }

    Ok(())
}

impl HeadersFlag {
    pub fn empty() -> HeadersFlag {
        HeadersFlag(0)
    }

    pub fn load(bits: u8) -> HeadersFlag {
        HeadersFlag(bits & ALL)
    }

    pub fn is_end_stream(&self) -> bool {
        self.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.0 |= END_STREAM;
    }

    pub fn is_end_headers(&self) -> bool {
        self.0 & END_HEADERS == END_HEADERS
    }

    pub fn is_priority(&self) -> bool {
        self.0 & PRIORITY == PRIORITY
    }

    fn set_priority(&mut self) {
        self.0 |= PRIORITY;
    }
}

impl Default for HeadersFlag {
    fn default() -> Self {
        HeadersFlag(END_HEADERS)
    }
}

impl From<HeadersFlag> for u8 {
    fn from(src: HeadersFlag) -> u8 {
        src.0
    }
}

impl fmt::Debug for HeadersFlag {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        util::debug_flags(fmt, self.0)
            .flag_if(self.is_end_headers(), "END_HEADERS")
            .flag_if(self.is_end_stream(), "END_STREAM")
            .flag_if(self.0 & PADDED == PADDED, "PADDED")
            .flag_if(self.is_priority(), "PRIORITY")
            .finish()
    }
}
