//! The application-facing contract: building an environment from Params,
//! and the WSGI-style `app(environ, start_response) -> body` calling
//! convention.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

use crate::error::FcgiError;
use crate::nvpair::NameValues;

/// The writable `wsgi.errors` text sink. Collected into an in-memory
/// buffer for the lifetime of the request; the engine itself never reads
/// it back (matching `original_source`, where nothing downstream of
/// `_Request._process` reads its `io.StringIO()` either), but it's a
/// mandatory key in the environment table and applications may use it
/// for diagnostic output.
#[derive(Debug, Clone, Default)]
pub struct ErrorsSink(RefCell<String>);

impl ErrorsSink {
    pub fn write(&self, s: &str) {
        self.0.borrow_mut().push_str(s);
    }

    pub fn contents(&self) -> String {
        self.0.borrow().clone()
    }
}

/// The per-request environment handed to an [`Application`]. Analogous to
/// a WSGI `environ` dict: CGI variables plus the `wsgi.*` keys the gateway
/// itself supplies. Always built through [`build_environ`], which fixes
/// `version` to `(1, 0)` -- there's no meaningful default for it.
#[derive(Debug, Clone)]
pub struct Environ {
    /// CGI/FastCGI variables from the Params stream, decoded as UTF-8
    /// (lossily -- the wire format carries raw bytes, but HTTP header and
    /// CGI variable names and values are overwhelmingly ASCII/UTF-8 in
    /// practice, and the gateway layer is the natural place to make that
    /// call; see the GetValues module's byte-exact handling for where raw
    /// bytes still matter).
    pub vars: HashMap<String, String>,
    /// The request body, already fully buffered from the Stdin stream.
    pub input: Vec<u8>,
    /// `wsgi.url_scheme`. Defaults to `"http"` when `REQUEST_SCHEME` is
    /// absent from Params, per the WSGI gateway convention.
    pub url_scheme: String,
    /// `wsgi.version`: `(1, 0)`, fixed by the WSGI environment table.
    pub version: (u32, u32),
    /// `wsgi.errors`: a writable diagnostic text sink, mandatory per the
    /// environment table even though this engine never reads it back.
    pub errors: ErrorsSink,
    /// `wsgi.multithread`: always true, since the pool may invoke the
    /// application from any worker thread.
    pub multithread: bool,
    /// `wsgi.multiprocess`: always false, this process serves every request.
    pub multiprocess: bool,
    /// `wsgi.run_once`: always false, the process is long-lived.
    pub run_once: bool,
}

impl Environ {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str())
    }
}

/// Build an [`Environ`] from a decoded Params stream and the buffered
/// Stdin body. Values are decoded lossily from UTF-8 since CGI variable
/// values are conventionally textual.
pub fn build_environ(params: &NameValues, input: Vec<u8>) -> Environ {
    let mut vars = HashMap::with_capacity(params.len());
    for (name, value) in params {
        vars.insert(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }
    let url_scheme = vars
        .get("REQUEST_SCHEME")
        .cloned()
        .unwrap_or_else(|| "http".to_string());
    Environ {
        vars,
        input,
        url_scheme,
        version: (1, 0),
        errors: ErrorsSink::default(),
        multithread: true,
        multiprocess: false,
        run_once: false,
    }
}

/// Return the subset of the environment that looks like an inbound HTTP
/// header: CGI's `HTTP_FOO_BAR` convention, restored to `Foo-Bar`.
///
/// Grounded in the commented-out `extract_headers` sketch in the
/// teacher's `fcgi_main.rs`.
pub fn http_headers(environ: &Environ) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (k, v) in &environ.vars {
        if let Some(rest) = k.strip_prefix("HTTP_") {
            let name = rest
                .split('_')
                .map(title_case)
                .collect::<Vec<_>>()
                .join("-");
            headers.insert(name, v.clone());
        }
    }
    headers
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
        None => String::new(),
    }
}

/// The capability an [`Application`]'s response body may optionally
/// implement: release resources once the gateway is done iterating it.
/// Probed at runtime by the connection handler via [`Iterator::size_hint`]
/// substitutes -- concretely, the gateway downcasts or calls
/// [`ResponseBody::close`] unconditionally since the trait supplies a
/// no-op default, matching the "probed... but optional" language in the
/// calling convention.
pub trait ResponseBody: Iterator<Item = Vec<u8>> {
    /// Called exactly once after the last item is yielded, or if the
    /// gateway abandons iteration early (e.g. the client disconnected).
    /// The default implementation does nothing.
    fn close(&mut self) {}
}

impl<T: Iterator<Item = Vec<u8>>> ResponseBody for T {}

/// The `start_response(status, headers, exc_info)` half of the calling
/// convention. An [`Application`] calls this exactly once before
/// yielding its first body chunk. A second call before any header bytes
/// have been written is only permitted when `exc_info` is supplied (the
/// WSGI re-raise path, e.g. after a handler recovers from an error and
/// wants to overwrite the status it already committed to); a call after
/// headers have already been flushed is always rejected, `exc_info` or
/// not, matching `_Request._start_response` in
/// `original_source/fastcgi/wsgi.py`.
pub trait StartResponse {
    /// Record the status line and headers for this response. `status`
    /// is the full status line, e.g. `"200 OK"`. `exc_info` authorizes
    /// overwriting headers that were already set (but not yet flushed);
    /// pass `None` on the ordinary, first call.
    fn start_response(
        &mut self,
        status: &str,
        headers: Vec<(String, String)>,
        exc_info: Option<anyhow::Error>,
    ) -> Result<(), FcgiError>;
}

/// An application callable. `Send + Sync` because the worker pool may
/// invoke it from any thread, and concurrently across threads if
/// `min_workers` exceeds one; applications that aren't safe to call
/// concurrently should document `min_workers = 1` rather than relying on
/// the gateway to serialize calls for them.
pub trait Application: Send + Sync {
    /// Handle one request, writing status/headers via `responder` and
    /// returning the response body as a boxed iterator of byte chunks.
    fn call(
        &self,
        environ: &Environ,
        responder: &mut dyn StartResponse,
    ) -> io::Result<Box<dyn ResponseBody + Send>>;
}

/// Wrap a plain function as an [`Application`]. Convenience for small
/// handlers and tests, mirroring `fastcgi::run(|req| ...)` in the
/// teacher's stdin/stdout API.
pub struct FnApplication<F>(pub F);

impl<F> Application for FnApplication<F>
where
    F: Fn(&Environ, &mut dyn StartResponse) -> io::Result<Box<dyn ResponseBody + Send>>
        + Send
        + Sync,
{
    fn call(
        &self,
        environ: &Environ,
        responder: &mut dyn StartResponse,
    ) -> io::Result<Box<dyn ResponseBody + Send>> {
        (self.0)(environ, responder)
    }
}

/// Adapt an already-collected list of chunks into a [`ResponseBody`].
pub struct IterBody {
    chunks: std::vec::IntoIter<Vec<u8>>,
}

impl IterBody {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        IterBody {
            chunks: chunks.into_iter(),
        }
    }
}

impl Iterator for IterBody {
    type Item = Vec<u8>;
    fn next(&mut self) -> Option<Vec<u8>> {
        self.chunks.next()
    }
}
