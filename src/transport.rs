//! Optional message transport for publishing intermediate images.
//!
//! Availability is decided once by `probe` at startup. A missing or
//! unreachable transport is not an error: the publishing sink graph is simply
//! never enabled.

use crate::Result;
use crate::cell::RgbImage;

use anyhow::{Context, bail};
use image::imageops::{self, FilterType};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::rc::Rc;

/// Largest datagram `publish` will send.
pub const MAX_DATAGRAM: usize = 60_000;
/// Images are downsampled so that their longer side is at most this.
pub const MAX_SIDE: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `host:port` of the receiver.
    pub address: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_frame_id")]
    pub frame_id: String,
}

fn default_topic() -> String {
    "features".to_string()
}

pub fn default_frame_id() -> String {
    "camera_rgb_optical_frame".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMessage {
    pub frame_id: String,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Vec<u8>,
}

impl ImageMessage {
    /// Downsample (nearest neighbour) so the longer side fits `max_side`.
    pub fn from_rgb(image: &RgbImage, frame_id: &str, max_side: u32) -> Self {
        let (w, h) = image.dimensions();
        let longest = w.max(h).max(1);
        let small = if longest > max_side {
            let nw = (w * max_side / longest).max(1);
            let nh = (h * max_side / longest).max(1);
            imageops::resize(image, nw, nh, FilterType::Nearest)
        } else {
            image.clone()
        };
        Self {
            frame_id: frame_id.to_string(),
            width: small.width(),
            height: small.height(),
            encoding: "rgb8".to_string(),
            data: small.into_raw(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    message: &'a ImageMessage,
}

/// Connected, non-blocking UDP publisher.
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Rc<UdpSocket>,
}

/// Try once to open the configured transport.
pub fn probe(config: Option<&TransportConfig>) -> Option<Transport> {
    let config = config?;
    match connect(&config.address) {
        Ok(transport) => {
            info!("transport available at {}", config.address);
            Some(transport)
        }
        Err(err) => {
            warn!("transport disabled: {:#}", err);
            None
        }
    }
}

fn connect(address: &str) -> Result<Transport> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind a UDP socket")?;
    socket
        .connect(address)
        .with_context(|| format!("failed to connect to {}", address))?;
    socket.set_nonblocking(true)?;
    Ok(Transport {
        socket: Rc::new(socket),
    })
}

pub fn validate_topic(topic: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_/]*$")?;
    if !re.is_match(topic) {
        bail!("invalid topic name {:?}", topic);
    }
    Ok(())
}

impl Transport {
    /// Send one message; a full socket buffer drops the message.
    pub fn publish(&self, topic: &str, message: &ImageMessage) -> Result<()> {
        let payload = serde_json::to_vec(&Envelope { topic, message })?;
        if payload.len() > MAX_DATAGRAM {
            bail!(
                "message on {} is {} bytes, limit is {}",
                topic,
                payload.len(),
                MAX_DATAGRAM
            );
        }
        match self.socket.send(&payload) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                debug!("{}: send buffer full, message dropped", topic);
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to publish on {}", topic)),
        }
    }
}
