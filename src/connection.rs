//! Per-connection state machine: reads records from an accepted stream,
//! assembles one in-flight request at a time, invokes the application,
//! and writes the response back as Stdout/EndRequest records.
//!
//! Grounded in `original_source/fastcgi/wsgi.py`'s `Server._make_task` and
//! `_Request`; the read loop's dispatch-by-state structure is carried
//! over almost directly, generalized to a named `ConnState` rather than
//! the Python version's `req: _Request|None` sentinel.

use std::io::{BufRead, Write};

use log::{debug, warn};

use crate::error::FcgiError;
use crate::gateway::{build_environ, Application, Environ, StartResponse};
use crate::nvpair::{decode_name_values, NameValues};
use crate::record::{ProtocolStatus, Record, Role};

/// Maximum content length for a single Stdout record, per the FCGI wire
/// format's 16-bit content-length field.
const RECORD_MAX_DATA_LENGTH: usize = 2usize.pow(16) - 1;

#[derive(Debug)]
enum ConnState {
    /// No request in flight; waiting for a BeginRequest (or a management
    /// record, which is answered without leaving this state).
    Idle,
    /// A BeginRequest has arrived; accumulating Params and Stdin until an
    /// empty Stdin record signals end-of-request-body.
    AwaitingBody(RequestState),
}

struct RequestState {
    request_id: u16,
    keep_conn: bool,
    role: Role,
    params_buf: Vec<u8>,
    stdin_buf: Vec<u8>,
}

/// Drive one connection to completion: read records from `reader`, write
/// the response to `writer`, invoke `app` once per request. Returns once
/// the peer closes the connection or a non-`keep_conn` request completes.
pub fn serve_connection<R, W>(
    reader: &mut R,
    writer: &mut W,
    app: &dyn Application,
) -> Result<(), FcgiError>
where
    R: BufRead,
    W: Write,
{
    let mut state = ConnState::Idle;
    loop {
        let rc = match Record::read_from_stream(reader) {
            Ok(Some(rc)) => rc,
            Ok(None) => {
                if matches!(state, ConnState::AwaitingBody(_)) {
                    return Err(FcgiError::Truncated);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        state = match (state, rc) {
            (ConnState::Idle, Record::GetValues { names, .. }) => {
                let result = answer_get_values(&names);
                write_record(writer, Record::get_values_result(result))?;
                ConnState::Idle
            }
            (ConnState::Idle, Record::BeginRequest { request_id, role, keep_conn, .. }) => {
                ConnState::AwaitingBody(RequestState {
                    request_id,
                    keep_conn,
                    role,
                    params_buf: Vec::new(),
                    stdin_buf: Vec::new(),
                })
            }
            (ConnState::Idle, other) => {
                return Err(FcgiError::ProtocolViolation(format!(
                    "unexpected record in Idle state: {other:?}"
                )));
            }
            (ConnState::AwaitingBody(mut req), Record::Params { request_id, content, .. }) => {
                check_same_request(&req, request_id)?;
                req.params_buf.extend_from_slice(&content);
                ConnState::AwaitingBody(req)
            }
            (ConnState::AwaitingBody(mut req), Record::Stdin { request_id, content, .. }) => {
                check_same_request(&req, request_id)?;
                if content.is_empty() {
                    run_request(writer, app, &req)?;
                    let keep_conn = req.keep_conn;
                    if !keep_conn {
                        return Ok(());
                    }
                    ConnState::Idle
                } else {
                    req.stdin_buf.extend_from_slice(&content);
                    ConnState::AwaitingBody(req)
                }
            }
            (ConnState::AwaitingBody(req), Record::AbortRequest { request_id, .. }) => {
                check_same_request(&req, request_id)?;
                debug!("AbortRequest received for request {request_id}; not acted on");
                ConnState::AwaitingBody(req)
            }
            (ConnState::AwaitingBody(_), other) => {
                return Err(FcgiError::ProtocolViolation(format!(
                    "unexpected record while awaiting body: {other:?}"
                )));
            }
        };
    }
}

fn check_same_request(req: &RequestState, request_id: u16) -> Result<(), FcgiError> {
    if request_id != req.request_id {
        Err(FcgiError::ProtocolViolation(format!(
            "record for request {request_id} while {} is in flight",
            req.request_id
        )))
    } else {
        Ok(())
    }
}

fn answer_get_values(names: &indexmap::IndexSet<Vec<u8>>) -> NameValues {
    let mut out = NameValues::new();
    for name in names {
        let value = match name.as_slice() {
            b"FCGI_MAX_CONNS" => Some(b"1000".to_vec()),
            b"FCGI_MAX_REQS" => Some(b"1000".to_vec()),
            b"FCGI_MPXS_CONNS" => Some(b"0".to_vec()),
            _ => None,
        };
        if let Some(v) = value {
            out.insert(name.clone(), v);
        }
    }
    out
}

struct ResponseWriter<'a, W: Write> {
    request_id: u16,
    writer: &'a mut W,
    headers: Vec<String>,
    headers_written: bool,
}

impl<'a, W: Write> StartResponse for ResponseWriter<'a, W> {
    fn start_response(
        &mut self,
        status: &str,
        headers: Vec<(String, String)>,
        exc_info: Option<anyhow::Error>,
    ) -> Result<(), FcgiError> {
        if self.headers_written {
            return Err(FcgiError::ProtocolViolation(
                "start_response called after headers were already written".into(),
            ));
        }
        if !self.headers.is_empty() && exc_info.is_none() {
            return Err(FcgiError::ProtocolViolation(
                "start_response called again without exc_info".into(),
            ));
        }
        let mut lines = Vec::with_capacity(headers.len() + 3);
        lines.push(format!("HTTP/1.0 {status}"));
        for (k, v) in headers {
            lines.push(format!("{k}: {v}"));
        }
        lines.push(String::new());
        lines.push(String::new());
        self.headers = lines;
        Ok(())
    }
}

impl<'a, W: Write> ResponseWriter<'a, W> {
    fn write_body_chunk(&mut self, data: &[u8]) -> Result<(), FcgiError> {
        self.write_headers()?;
        if data.is_empty() {
            return Ok(());
        }
        let mut off = 0;
        while off < data.len() {
            let n = std::cmp::min(data.len() - off, RECORD_MAX_DATA_LENGTH);
            write_record(
                self.writer,
                Record::stdout(self.request_id, data[off..off + n].to_vec())?,
            )?;
            off += n;
        }
        Ok(())
    }

    fn write_headers(&mut self) -> Result<(), FcgiError> {
        if self.headers_written {
            return Ok(());
        }
        if self.headers.is_empty() {
            return Err(FcgiError::ProtocolViolation(
                "application produced a body before calling start_response".into(),
            ));
        }
        self.headers_written = true;
        let blob = self.headers.join("\r\n").into_bytes();
        self.headers.clear();
        write_record(self.writer, Record::stdout(self.request_id, blob)?)
    }
}

fn write_record<W: Write>(writer: &mut W, rc: Record) -> Result<(), FcgiError> {
    rc.write_to_stream(writer)
}

fn run_request<W: Write>(
    writer: &mut W,
    app: &dyn Application,
    req: &RequestState,
) -> Result<(), FcgiError> {
    let params = decode_name_values(&req.params_buf)?;
    let environ = build_environ(&params, req.stdin_buf.clone());

    let mut responder = ResponseWriter {
        request_id: req.request_id,
        writer,
        headers: Vec::new(),
        headers_written: false,
    };

    let outcome = invoke_application(app, &environ, &mut responder, req.role);

    match outcome {
        Ok(()) => {
            responder.write_headers()?;
            write_record(responder.writer, Record::stdout(req.request_id, Vec::new())?)?;
            write_record(
                responder.writer,
                Record::end_request(req.request_id, 0, ProtocolStatus::RequestComplete)?,
            )
        }
        Err(e) if e.is_broken_pipe() => Err(e),
        Err(e) => {
            warn!("application error on request {}: {e}", req.request_id);
            let _ = write_record(
                responder.writer,
                Record::stderr(req.request_id, format!("{e}\n").into_bytes())?,
            );
            write_record(
                responder.writer,
                Record::end_request(req.request_id, 1, ProtocolStatus::RequestComplete)?,
            )
        }
    }
}

fn invoke_application<W: Write>(
    app: &dyn Application,
    environ: &Environ,
    responder: &mut ResponseWriter<'_, W>,
    role: Role,
) -> Result<(), FcgiError> {
    if !matches!(role, Role::Responder) {
        return Err(FcgiError::ProtocolViolation(format!(
            "unsupported role {role:?}; only Responder is implemented"
        )));
    }
    let mut body = app
        .call(environ, responder)
        .map_err(|e| FcgiError::Application(e.into()))?;
    let result = (|| -> Result<(), FcgiError> {
        while let Some(chunk) = body.next() {
            responder.write_body_chunk(&chunk)?;
        }
        Ok(())
    })();
    body.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{FnApplication, IterBody, ResponseBody};
    use crate::nvpair::encode_name_values;
    use std::io::Cursor;

    fn begin_bytes(request_id: u16, keep_conn: bool) -> Vec<u8> {
        Record::begin_request(request_id, Role::Responder, keep_conn)
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn params_bytes(request_id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut nv = NameValues::new();
        for (k, v) in pairs {
            nv.insert(k.as_bytes().to_vec(), v.as_bytes().to_vec());
        }
        let content = encode_name_values(&nv);
        Record::params(request_id, content).unwrap().to_bytes().unwrap()
    }

    fn empty_params_bytes(request_id: u16) -> Vec<u8> {
        Record::params(request_id, Vec::new()).unwrap().to_bytes().unwrap()
    }

    fn stdin_bytes(request_id: u16, content: &[u8]) -> Vec<u8> {
        Record::stdin(request_id, content.to_vec())
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    fn echo_app() -> FnApplication<impl Fn(
        &Environ,
        &mut dyn StartResponse,
    ) -> std::io::Result<Box<dyn ResponseBody + Send>>> {
        FnApplication(|env: &Environ, resp: &mut dyn StartResponse| {
            resp.start_response(
                "200 OK",
                vec![("Content-Type".to_string(), "text/plain".to_string())],
                None,
            )
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            let mut out = b"hello ".to_vec();
            out.extend_from_slice(&env.input);
            Ok(Box::new(IterBody::new(vec![out])) as Box<dyn ResponseBody + Send>)
        })
    }

    #[test]
    fn end_to_end_single_request() {
        let mut input = Vec::new();
        input.extend(begin_bytes(1, false));
        input.extend(params_bytes(1, &[("REQUEST_METHOD", "GET")]));
        input.extend(empty_params_bytes(1));
        input.extend(stdin_bytes(1, b"world"));
        input.extend(stdin_bytes(1, b""));

        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        serve_connection(&mut reader, &mut output, &app).unwrap();

        let mut cursor = Cursor::new(output);
        let mut records = Vec::new();
        while let Some(rc) = Record::read_from_stream(&mut cursor).unwrap() {
            records.push(rc);
        }
        // header record, body record, empty stdout, end request
        assert_eq!(records.len(), 4);
        match &records[0] {
            Record::Stdout { content, .. } => {
                let text = String::from_utf8_lossy(content);
                assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
                assert!(text.contains("Content-Type: text/plain"));
            }
            other => panic!("expected Stdout, got {other:?}"),
        }
        match &records[1] {
            Record::Stdout { content, .. } => assert_eq!(content, b"hello world"),
            other => panic!("expected Stdout, got {other:?}"),
        }
        match &records[2] {
            Record::Stdout { content, .. } => assert!(content.is_empty()),
            other => panic!("expected empty Stdout, got {other:?}"),
        }
        match &records[3] {
            Record::EndRequest {
                protocol_status, ..
            } => assert_eq!(*protocol_status, ProtocolStatus::RequestComplete),
            other => panic!("expected EndRequest, got {other:?}"),
        }
    }

    #[test]
    fn get_values_answered_at_idle() {
        let names: indexmap::IndexSet<Vec<u8>> =
            [b"FCGI_MAX_CONNS".to_vec(), b"FCGI_UNKNOWN".to_vec()]
                .into_iter()
                .collect();
        let rc = Record::get_values(names);
        let mut input = rc.to_bytes().unwrap();
        input.extend(begin_bytes(2, false));
        input.extend(empty_params_bytes(2));
        input.extend(stdin_bytes(2, b""));

        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        serve_connection(&mut reader, &mut output, &app).unwrap();

        let mut cursor = Cursor::new(output);
        let first = Record::read_from_stream(&mut cursor).unwrap().unwrap();
        match first {
            Record::GetValuesResult { pairs, .. } => {
                assert_eq!(pairs.get(&b"FCGI_MAX_CONNS".to_vec()[..]), Some(&b"1000".to_vec()));
                assert!(!pairs.contains_key(&b"FCGI_UNKNOWN".to_vec()));
            }
            other => panic!("expected GetValuesResult, got {other:?}"),
        }
    }

    #[test]
    fn keep_conn_false_ends_after_one_request() {
        let mut input = Vec::new();
        input.extend(begin_bytes(1, false));
        input.extend(empty_params_bytes(1));
        input.extend(stdin_bytes(1, b""));
        // A second BeginRequest that must never be processed.
        input.extend(begin_bytes(2, false));

        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        serve_connection(&mut reader, &mut output, &app).unwrap();
        // Only one request's worth of records were written.
        let mut cursor = Cursor::new(output);
        let mut count = 0;
        while Record::read_from_stream(&mut cursor).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn unexpected_record_in_idle_is_protocol_violation() {
        let mut input = stdin_bytes(1, b"oops");
        input.truncate(input.len()); // request_id 1, no BeginRequest first
        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        let err = serve_connection(&mut reader, &mut output, &app).unwrap_err();
        assert!(matches!(err, FcgiError::ProtocolViolation(_)));
    }

    #[test]
    fn mismatched_request_id_is_protocol_violation() {
        let mut input = Vec::new();
        input.extend(begin_bytes(1, false));
        input.extend(empty_params_bytes(2)); // wrong id
        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        let err = serve_connection(&mut reader, &mut output, &app).unwrap_err();
        assert!(matches!(err, FcgiError::ProtocolViolation(_)));
    }

    #[test]
    fn truncated_mid_request_errors() {
        let mut input = Vec::new();
        input.extend(begin_bytes(1, false));
        input.extend(empty_params_bytes(1));
        // no Stdin at all before EOF
        let mut reader = Cursor::new(input);
        let mut output = Vec::new();
        let app = echo_app();
        let err = serve_connection(&mut reader, &mut output, &app).unwrap_err();
        assert!(matches!(err, FcgiError::Truncated));
    }

    fn response_writer(output: &mut Vec<u8>) -> ResponseWriter<'_, Vec<u8>> {
        ResponseWriter {
            request_id: 1,
            writer: output,
            headers: Vec::new(),
            headers_written: false,
        }
    }

    #[test]
    fn second_start_response_without_exc_info_is_rejected() {
        let mut output = Vec::new();
        let mut responder = response_writer(&mut output);
        responder.start_response("200 OK", Vec::new(), None).unwrap();
        let err = responder
            .start_response("500 Internal Server Error", Vec::new(), None)
            .unwrap_err();
        assert!(matches!(err, FcgiError::ProtocolViolation(_)));
    }

    #[test]
    fn second_start_response_with_exc_info_is_allowed_before_flush() {
        let mut output = Vec::new();
        let mut responder = response_writer(&mut output);
        responder.start_response("200 OK", Vec::new(), None).unwrap();
        responder
            .start_response(
                "500 Internal Server Error",
                Vec::new(),
                Some(anyhow::anyhow!("handler recovered from an error")),
            )
            .unwrap();
        responder.write_headers().unwrap();
        let mut cursor = Cursor::new(output);
        let rc = Record::read_from_stream(&mut cursor).unwrap().unwrap();
        match rc {
            Record::Stdout { content, .. } => {
                assert!(String::from_utf8_lossy(&content).starts_with("HTTP/1.0 500"));
            }
            other => panic!("expected Stdout, got {other:?}"),
        }
    }

    #[test]
    fn start_response_after_headers_written_is_rejected() {
        let mut output = Vec::new();
        let mut responder = response_writer(&mut output);
        responder.start_response("200 OK", Vec::new(), None).unwrap();
        responder.write_headers().unwrap();
        let err = responder
            .start_response("200 OK", Vec::new(), None)
            .unwrap_err();
        assert!(matches!(err, FcgiError::ProtocolViolation(_)));
    }
}
