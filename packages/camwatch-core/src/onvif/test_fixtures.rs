//! Canned ONVIF responses and a scripted transport shared by the test modules.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::state::OnvifAddress;
use super::transport::{HttpReply, SoapTransport, TransportError};

/// One request seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub address: OnvifAddress,
    pub path: String,
    pub content_type: String,
    pub body: String,
    pub secured: bool,
}

type Script = dyn Fn(&SeenRequest) -> Option<HttpReply> + Send + Sync;

/// Answers requests from a closure; `None` means no HTTP response.
pub struct ScriptedTransport {
    script: Box<Script>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&SeenRequest) -> Option<HttpReply> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl SoapTransport for ScriptedTransport {
    async fn post(
        &self,
        address: &OnvifAddress,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<HttpReply, TransportError> {
        let request = SeenRequest {
            address: address.clone(),
            path: path.to_string(),
            content_type: content_type.to_string(),
            secured: body.contains("<UsernameToken>"),
            body,
        };
        let reply = (self.script)(&request);
        self.seen.lock().push(request);
        reply.ok_or_else(|| TransportError::NoResponse("scripted".into()))
    }
}

pub fn ok(body: &str) -> HttpReply {
    HttpReply {
        status: 200,
        body: body.to_string(),
    }
}

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema"><SOAP-ENV:Body>{body}</SOAP-ENV:Body></SOAP-ENV:Envelope>"#
    )
}

pub const DATE_TIME_BODY: &str = r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema"><SOAP-ENV:Body><tds:GetSystemDateAndTimeResponse><tds:SystemDateAndTime><tt:DateTimeType>NTP</tt:DateTimeType><tt:UTCDateTime><tt:Time><tt:Hour>8</tt:Hour><tt:Minute>30</tt:Minute><tt:Second>0</tt:Second></tt:Time><tt:Date><tt:Year>2001</tt:Year><tt:Month>2</tt:Month><tt:Day>3</tt:Day></tt:Date></tt:UTCDateTime></tds:SystemDateAndTime></tds:GetSystemDateAndTimeResponse></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;

pub const DEVICE_INFO_BODY: &str = r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope" xmlns:tds="http://www.onvif.org/ver10/device/wsdl"><SOAP-ENV:Body><tds:GetDeviceInformationResponse><tds:Manufacturer>ACME</tds:Manufacturer><tds:Model>X100</tds:Model><tds:FirmwareVersion>1.0</tds:FirmwareVersion><tds:SerialNumber>SN1</tds:SerialNumber><tds:HardwareId>HW1</tds:HardwareId></tds:GetDeviceInformationResponse></SOAP-ENV:Body></SOAP-ENV:Envelope>"#;

/// Profiles whose name and token are both the given string.
pub fn profiles_body(tokens: &[&str]) -> String {
    let profiles: String = tokens
        .iter()
        .map(|t| {
            format!(
                r#"<trt:Profiles token="{t}"><tt:Name>{t}</tt:Name><tt:VideoEncoderConfiguration token="enc_{t}"><tt:Encoding>H264</tt:Encoding><tt:Resolution><tt:Width>640</tt:Width><tt:Height>480</tt:Height></tt:Resolution></tt:VideoEncoderConfiguration></trt:Profiles>"#
            )
        })
        .collect();
    envelope(&format!("<trt:GetProfilesResponse>{profiles}</trt:GetProfilesResponse>"))
}

pub fn stream_uri_body(uri: &str) -> String {
    envelope(&format!(
        "<trt:GetStreamUriResponse><trt:MediaUri><tt:Uri>{uri}</tt:Uri><tt:Timeout>PT0S</tt:Timeout></trt:MediaUri></trt:GetStreamUriResponse>"
    ))
}

pub fn fault_body(code: &str, subcode: Option<&str>) -> String {
    let subcode = subcode
        .map(|s| format!("<SOAP-ENV:Subcode><SOAP-ENV:Value>{s}</SOAP-ENV:Value></SOAP-ENV:Subcode>"))
        .unwrap_or_default();
    envelope(&format!(
        "<SOAP-ENV:Fault><SOAP-ENV:Code><SOAP-ENV:Value>SOAP-ENV:{code}</SOAP-ENV:Value>{subcode}</SOAP-ENV:Code><SOAP-ENV:Reason><SOAP-ENV:Text>failed</SOAP-ENV:Text></SOAP-ENV:Reason></SOAP-ENV:Fault>"
    ))
}
