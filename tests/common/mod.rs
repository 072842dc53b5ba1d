//! Common fixtures for integration tests

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Builds a ProbeMatches datagram with one match per `(endpoint, xaddr)` pair
pub fn probe_matches_datagram(matches: &[(&str, &str)]) -> Vec<u8> {
    let mut body = String::new();
    for (endpoint, xaddr) in matches {
        body.push_str(&format!(
            "<d:ProbeMatch>\
               <wsa:EndpointReference><wsa:Address>{endpoint}</wsa:Address></wsa:EndpointReference>\
               <d:Types>dn:NetworkVideoTransmitter</d:Types>\
               <d:Scopes>onvif://www.onvif.org/type/video_encoder</d:Scopes>\
               <d:XAddrs>{xaddr}</d:XAddrs>\
               <d:MetadataVersion>1</d:MetadataVersion>\
             </d:ProbeMatch>"
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing"
    xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery"
    xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
  <env:Header>
    <wsa:MessageID>urn:uuid:2f6b3c4d-1a2b-4c3d-8e9f-0a1b2c3d4e5f</wsa:MessageID>
    <wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/ProbeMatches</wsa:Action>
  </env:Header>
  <env:Body><d:ProbeMatches>{body}</d:ProbeMatches></env:Body>
</env:Envelope>"#
    )
    .into_bytes()
}

/// Encodes a small gradient as a real JPEG
pub fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 9 % 256) as u8, (y * 13 % 256) as u8, 96])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .expect("JPEG encoding failed");
    bytes
}

/// Wraps a JPEG in the multipart framing MJPEG servers send
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
