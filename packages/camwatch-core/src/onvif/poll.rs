//! One-shot poll of a single ONVIF device.
//!
//! A poll walks the device's candidate addresses and, per address, measures
//! the clock offset, fetches device information and, for the user-selected
//! address only, the media profiles and their stream URIs. The refined state
//! is handed back to the manager, which decides whether it is still current.

use std::sync::Arc;

use chrono::Utc;

use super::codec::{
    parse_device_information, parse_fault, parse_profiles, parse_stream_uri,
    parse_system_date_and_time, FaultCode, OnvifRequest, UsernameToken,
};
use super::state::{FailureReason, OnvifAddress, OnvifDeviceState, StreamUri};
use super::transport::SoapTransport;
use crate::protocol_constants::{DEVICE_SERVICE_PATHS, MEDIA_SERVICE_PATHS, ONVIF_TRANSPORTS};
use crate::utils::mask_url_credentials;
use crate::xml::{self, XmlElement};

/// Refines one device state over HTTP.
pub struct DevicePoll {
    state: OnvifDeviceState,
    transport: Arc<dyn SoapTransport>,
    log_prefix: String,
}

impl DevicePoll {
    /// `state` must already carry the device's current settings.
    pub fn new(state: OnvifDeviceState, transport: Arc<dyn SoapTransport>) -> Self {
        let log_prefix = format!("[OnvifPoll] {} gen {}", state.log_id(), state.generation);
        Self {
            state,
            transport,
            log_prefix,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    pub fn state(&self) -> &OnvifDeviceState {
        &self.state
    }

    /// Runs the poll to completion and returns the refined state.
    pub async fn run(mut self) -> OnvifDeviceState {
        let credentials = self.state.credentials().is_some();
        let selected = self.state.selected_address().cloned();
        let addresses = match &selected {
            Some(addr) => vec![addr.clone()],
            None => self.state.announced_addrs.clone(),
        };
        log::debug!(
            "{} - trying {:?}, credentials {}",
            self.log_prefix,
            addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            if credentials { "exist" } else { "do not exist" }
        );

        for address in &addresses {
            self.poll_address(address, credentials && selected.as_ref() == Some(address))
                .await;
        }
        self.state
    }

    async fn poll_address(&mut self, address: &OnvifAddress, fetch_media: bool) {
        if let Some(doc) = self
            .send_request(
                "getSystemDateAndTime",
                address,
                &DEVICE_SERVICE_PATHS,
                &OnvifRequest::get_system_date_and_time(),
                false,
            )
            .await
        {
            match parse_system_date_and_time(&doc) {
                Ok(device_time) => {
                    self.state.clock_offset = device_time - Utc::now();
                    log::debug!(
                        "{} - {} - time offset is {}s",
                        self.log_prefix,
                        address,
                        self.state.clock_offset.num_seconds()
                    );
                }
                Err(e) => log::debug!("{} - {} - no usable time: {}", self.log_prefix, address, e),
            }
        }

        if let Some(doc) = self
            .send_request(
                "getDeviceInformation",
                address,
                &DEVICE_SERVICE_PATHS,
                &OnvifRequest::get_device_information(),
                false,
            )
            .await
        {
            match parse_device_information(&doc) {
                Ok(info) => {
                    log::info!("{} - {} - device information {:?}", self.log_prefix, address, info);
                    self.state.basic_info = Some(info);
                }
                Err(e) => log::debug!("{} - {} - no device information: {}", self.log_prefix, address, e),
            }
        }

        // Profiles are only worth fetching where the user will stream from.
        if !fetch_media {
            return;
        }

        let media_paths: Vec<&str> = MEDIA_SERVICE_PATHS
            .iter()
            .chain(DEVICE_SERVICE_PATHS.iter())
            .copied()
            .collect();

        let doc = self
            .send_request(
                "getProfiles",
                address,
                &media_paths,
                &OnvifRequest::get_profiles(),
                true,
            )
            .await;
        let profiles = match &doc {
            Some(doc) => parse_profiles(doc).unwrap_or_else(|e| {
                log::debug!("{} - {} - unusable profiles: {}", self.log_prefix, address, e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        log::info!("{} - {} - {} profiles retrieved", self.log_prefix, address, profiles.len());
        self.state.profiles = profiles.clone();
        if profiles.is_empty() {
            if let Some(doc) = &doc {
                self.process_fault(doc);
            }
            return;
        }

        for profile in &profiles {
            for transport in ONVIF_TRANSPORTS {
                log::info!(
                    "{} - {} - getting stream URI for '{}' ({})",
                    self.log_prefix,
                    address,
                    profile.name,
                    transport
                );
                let Some(doc) = self
                    .send_request(
                        "getStreamUri",
                        address,
                        &media_paths,
                        &OnvifRequest::get_stream_uri(transport, &profile.token),
                        true,
                    )
                    .await
                else {
                    continue;
                };
                match parse_stream_uri(&doc) {
                    Ok(uri) => {
                        log::info!(
                            "{} - {} - stream URI '{}' (profile='{}', transport='{}')",
                            self.log_prefix,
                            address,
                            mask_url_credentials(&uri),
                            profile.name,
                            transport
                        );
                        self.state.stream_uris.insert(
                            profile.token.clone(),
                            StreamUri {
                                uri,
                                transport: transport.to_string(),
                            },
                        );
                        break;
                    }
                    Err(_) => {
                        self.process_fault(&doc);
                    }
                }
            }
        }
    }

    /// Sends `request` to `address`, walking `paths` until one answers 200.
    ///
    /// With credentials, each path is tried without and then with a security
    /// header, or only with one when `only_secure` is set. Any HTTP status
    /// marks the address reachable. When nothing answers 200, the failure
    /// reason becomes the fault of the last error body, or the
    /// `HttpRequestError` sentinel.
    pub async fn send_request(
        &mut self,
        op: &str,
        address: &OnvifAddress,
        paths: &[&str],
        request: &OnvifRequest,
        only_secure: bool,
    ) -> Option<XmlElement> {
        let credentials = self.state.settings.credentials.clone();
        let attempts: &[bool] = match (&credentials, only_secure) {
            (Some(_), true) => &[true],
            (Some(_), false) => &[false, true],
            (None, _) => &[false],
        };
        log::debug!("{} - {} - {} starting", self.log_prefix, address, op);

        let mut error_body: Option<String> = None;
        for path in paths {
            let mut status = None;
            let mut reply_body = String::new();

            for &with_auth in attempts {
                let token = match (&credentials, with_auth) {
                    (Some(creds), true) => {
                        log::debug!("{} - {} - {} trying with auth", self.log_prefix, address, op);
                        Some(UsernameToken::new(creds, self.state.clock_offset))
                    }
                    _ => None,
                };
                let body = request.to_xml(token.as_ref());

                let reply = match self
                    .transport
                    .post(address, path, &request.content_type(), body)
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::debug!("{} - {} - {} on {}: {}", self.log_prefix, address, op, path, e);
                        status = None;
                        break;
                    }
                };
                status = Some(reply.status);
                reply_body = reply.body;

                if matches!(reply.status, 400 | 401) {
                    if with_auth || credentials.is_none() {
                        log::error!("{} - {} - {} failed ({})", self.log_prefix, address, op, reply.status);
                    }
                    continue;
                }
                if with_auth && reply.status == 200 {
                    self.state.authenticated = true;
                }
                break;
            }

            let Some(status) = status else {
                log::error!("{} - {} - {} failed (no response on {})", self.log_prefix, address, op, path);
                continue;
            };
            self.state.mark_reachable(address);

            match status {
                200 => match xml::parse(&reply_body) {
                    Ok(doc) => {
                        log::debug!("{} - {} - {} success", self.log_prefix, address, op);
                        return Some(doc);
                    }
                    Err(e) => {
                        log::warn!("{} - {} - {} returned unusable XML: {}", self.log_prefix, address, op, e);
                        break;
                    }
                },
                400 | 401 => log::warn!(
                    "{} - {} - {} failed ({}, sender is not authorized)",
                    self.log_prefix,
                    address,
                    op,
                    status
                ),
                404 | 503 => log::warn!(
                    "{} - {} - {} failed ({}, device does not support the '{}' service path)",
                    self.log_prefix,
                    address,
                    op,
                    status,
                    path
                ),
                _ => log::error!("{} - {} - {} failed ({})", self.log_prefix, address, op, status),
            }
            error_body = Some(reply_body);
        }

        let fault = error_body
            .and_then(|body| xml::parse(&body).ok())
            .and_then(|doc| self.process_fault(&doc));
        if fault.is_none() {
            self.state.last_failure_reason = Some(FailureReason::HttpRequestError);
        }
        None
    }

    /// Records the SOAP fault carried by `doc`, if any.
    fn process_fault(&mut self, doc: &XmlElement) -> Option<FaultCode> {
        let code = match parse_fault(doc) {
            Ok(Some(code)) => code,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("{} - unreadable fault: {}", self.log_prefix, e);
                return None;
            }
        };
        if code == FaultCode::NotAuthorized {
            log::error!("{} - incorrect username or password", self.log_prefix);
            self.state.authenticated = false;
        } else {
            log::error!("{} - fault code received: {}", self.log_prefix, code);
        }
        self.state.last_failure_reason = Some(FailureReason::Fault(code.clone()));
        Some(code)
    }
}
