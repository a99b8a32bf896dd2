//! SSDP datagrams, description documents and a one-shot HTTP server shared by
//! the UPnP test modules.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const CAMERA_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <URLBase>http://192.168.1.20:80/</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
    <friendlyName>Front Door</friendlyName>
    <manufacturer>AXIS</manufacturer>
    <modelName>AXIS M1031-W</modelName>
    <modelNumber>M1031-W</modelNumber>
    <presentationURL>/index.html</presentationURL>
    <UDN>uuid:cam-1</UDN>
    <serviceList><service><serviceType>x</serviceType></service></serviceList>
    <deviceList>
      <device><friendlyName>Embedded</friendlyName></device>
    </deviceList>
  </device>
</root>"#;

/// `ssdp:alive` announcement for `usn`.
pub fn alive_notify(usn: &str, location: &str, max_age: u64) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         CACHE-CONTROL: max-age={max_age}\r\n\
         LOCATION: {location}\r\n\
         NT: {usn}\r\n\
         NTS: ssdp:alive\r\n\
         SERVER: Linux/2.6 UPnP/1.0 camera/1.0\r\n\
         USN: {usn}\r\n\
         \r\n"
    )
}

pub fn byebye_notify(usn: &str) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         NT: {usn}\r\n\
         NTS: ssdp:byebye\r\n\
         USN: {usn}\r\n\
         \r\n"
    )
}

/// Unicast reply to an M-SEARCH.
pub fn search_reply(usn: &str, st: &str, location: &str, server: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         CACHE-CONTROL: max-age=1800\r\n\
         EXT:\r\n\
         LOCATION: {location}\r\n\
         SERVER: {server}\r\n\
         ST: {st}\r\n\
         USN: {usn}\r\n\
         \r\n"
    )
}

pub fn http_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} X\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Serves `response` to the first connection and returns the request it
/// received.
pub fn serve_once(response: String) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        stream.write_all(response.as_bytes()).unwrap();
        String::from_utf8_lossy(&request).into_owned()
    });
    (addr, handle)
}
