//! SOAP fault bodies returned when the upstream call fails.

use std::collections::HashMap;

pub const SOAP11_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
pub const SOAP12_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Build a SOAP 1.2 (`is_soap12`) or SOAP 1.1 fault envelope.
pub fn create_soap_fault(message: &str, is_soap12: bool) -> String {
    let message = escape_xml(message);
    if is_soap12 {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>soap:Receiver</soap:Value>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">APInox Proxy Error</soap:Text>
      </soap:Reason>
      <soap:Detail>
        <Error xmlns="http://apinox.dev/error">
          <Message>{message}</Message>
          <Source>APInox Proxy</Source>
        </Error>
      </soap:Detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#
        )
    } else {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <soap:Body>
    <soap:Fault>
      <faultcode>soap:Server</faultcode>
      <faultstring>APInox Proxy Error</faultstring>
      <detail>
        <Error xmlns="http://apinox.dev/error">
          <Message>{message}</Message>
          <Source>APInox Proxy</Source>
        </Error>
      </detail>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#
        )
    }
}

/// SOAP flavour of a request, judged from its headers (lowercase keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    pub fn detect(headers: &HashMap<String, String>) -> Option<Self> {
        let content_type = headers
            .get("content-type")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        let is_soap = content_type.contains("soap") || headers.contains_key("soapaction");
        if !is_soap {
            return None;
        }
        if content_type.contains("application/soap+xml") {
            Some(SoapVersion::Soap12)
        } else {
            Some(SoapVersion::Soap11)
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SoapVersion::Soap11 => SOAP11_CONTENT_TYPE,
            SoapVersion::Soap12 => SOAP12_CONTENT_TYPE,
        }
    }

    pub fn fault(&self, message: &str) -> String {
        create_soap_fault(message, *self == SoapVersion::Soap12)
    }
}
