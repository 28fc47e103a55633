//! S3 error responses that mean the request was signed for the wrong place.

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::HeaderMap;

/// Set by S3 on responses for a bucket that lives in another region.
const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// Error codes S3 returns with 400 when the signature or its scope is wrong.
const SIGNATURE_ERROR_CODES: &[&str] = &[
    "AuthorizationHeaderMalformed",
    "SignatureDoesNotMatch",
    "AuthorizationQueryParametersError",
];

/// Whether S3 rejected the request's credentials rather than the request.
///
/// S3 answers a region mismatch with `400 AuthorizationHeaderMalformed`, or
/// with `301 PermanentRedirect` on regional hosts, instead of 401/403.
pub(crate) fn rejects_credentials(status: u16, headers: &HeaderMap, body: &[u8]) -> bool {
    match status {
        301 => {
            headers.contains_key(BUCKET_REGION_HEADER)
                || error_code(body).as_deref() == Some("PermanentRedirect")
        }
        400 => error_code(body).is_some_and(|code| SIGNATURE_ERROR_CODES.contains(&code.as_str())),
        _ => false,
    }
}

/// `<Error><Code>..</Code></Error>` value, if the body carries one.
///
/// Read event by event so a body cut short after `<Code>` still yields it.
pub(crate) fn error_code(body: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut in_code = false;

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(tag) => in_code = tag.name().as_ref() == b"Code",
            Event::Text(text) if in_code => {
                return text.unescape().ok().map(|code| code.trim().to_string());
            }
            Event::End(_) => in_code = false,
            Event::Eof => return None,
            _ => {}
        }
        buf.clear();
    }
}
