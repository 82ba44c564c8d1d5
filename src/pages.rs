//! Canned HTML error pages.
//!
//! Out of scope per spec.md §1 ("the management/monitoring HTML page");
//! these are the small, proxy-generated pages served directly to a client
//! in place of an origin response — `internal_error.html`, `dns.html`,
//! and so on, selected by filename and composed with a status code
//! (spec.md §6 "Error pages"). Per spec.md §4.6, the page is always
//! wrapped in an outer `HTTP/1.1 200` response; the real failure code is
//! only embedded in the body, since the client already has a live TCP
//! connection to the proxy, not to an origin that could set its own
//! status line.

const INTERNAL_ERROR_BODY: &str =
    "<html><head><title>{code} Proxy Error</title></head><body><h1>{code} Proxy Error</h1>\
<p>The proxy encountered an internal error handling this request.</p></body></html>";

const DNS_BODY: &str = "<html><head><title>{code} Name Not Resolved</title></head><body>\
<h1>{code} Name Not Resolved</h1><p>The hostname <code>{hostname}</code> could not be \
resolved.</p></body></html>";

const BAD_REQUEST_BODY: &str = "<html><head><title>{code} Bad Request</title></head><body>\
<h1>{code} Bad Request</h1><p>The request could not be parsed.</p></body></html>";

const UNSUPPORTED_METHOD_BODY: &str = "<html><head><title>{code} Not Implemented</title></head>\
<body><h1>{code} Not Implemented</h1><p>This method is not supported by the proxy.\
</p></body></html>";

fn body_for(template: &str) -> &'static str {
    match template {
        "dns.html" => DNS_BODY,
        "bad_request.html" => BAD_REQUEST_BODY,
        "unsupported_method.html" => UNSUPPORTED_METHOD_BODY,
        _ => INTERNAL_ERROR_BODY,
    }
}

/// Renders `template` with `code` substituted in, wrapped in a complete
/// `HTTP/1.1 200` response ready to write to the client socket.
pub fn render(code: &str, template: &str) -> String {
    render_with(code, template, &[])
}

/// Like [`render`], but also substitutes `{hostname}` — used for
/// `dns.html`, where the failing hostname is reported back to the client
/// (spec.md §8's DNS failure scenario).
pub fn render_dns(code: &str, hostname: &str) -> String {
    render_with(code, "dns.html", &[("hostname", hostname)])
}

fn render_with(code: &str, template: &str, extra: &[(&str, &str)]) -> String {
    let mut body = body_for(template).replace("{code}", code);
    for (key, value) in extra {
        body = body.replace(&format!("{{{key}}}"), value);
    }
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n\
         {}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeds_the_status_code_in_the_body_while_the_status_line_stays_200() {
        let page = render("502", "internal_error.html");
        assert!(page.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(page.contains("502 Proxy Error"));
    }

    #[test]
    fn dns_page_substitutes_the_failing_hostname() {
        let page = render_dns("503", "nxdomain.invalid");
        assert!(page.contains("nxdomain.invalid"));
        assert!(page.contains("503 Name Not Resolved"));
    }

    #[test]
    fn unknown_template_falls_back_to_internal_error() {
        let page = render("500", "whatever.html");
        assert!(page.contains("500 Proxy Error"));
    }
}
