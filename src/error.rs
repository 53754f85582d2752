/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use std::{io, net::AddrParseError};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
#[error("Error in child app {0}: {1}")]
pub struct ChildAppError(pub String, pub String);

pub type ChildAppResult<T> = Result<T, ChildAppError>;

#[derive(Error, Debug, Diagnostic)]
pub enum PierreApiError {
    #[error("Internal error: {0}")]
    Internal(#[from] Box<PierreInternalError>),
    #[error("Session error: {0}")]
    Session(#[from] Box<SessionApiError>),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum SessionApiError {
    #[error("Internal error: {0}")]
    Internal(#[from] Box<SessionInternalError>),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum PierreInternalError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Render error: {0}")]
    RenderError(#[from] RenderInternalError),
    #[error("Desk error: {0}")]
    DeskError(#[from] DeskInternalError),
    #[error("Error in child app: {0}")]
    ChildAppError(#[from] ChildAppError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum SessionInternalError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Session socket closed by peer.")]
    SessionClosed,
    #[error("No shared cipher key for session.")]
    NoSharedKey,
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),
    #[error("Error in session: {0}")]
    ChildAppError(#[from] ChildAppError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum RenderInternalError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Error in render loop: {0}")]
    ChildAppError(#[from] ChildAppError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum DeskInternalError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("MsgPack encode error: {0}")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Error in desk bridge: {0}")]
    ChildAppError(#[from] ChildAppError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid IP address: {0}")]
    InvalidIp(#[from] AddrParseError),
    #[error("Invalid session key: {0}")]
    InvalidSessionKey(String),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum ClockError {
    #[error("Shared memory segment {0} is not mapped")]
    NotMapped(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Clock shm version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },
    #[error("No master clock elected")]
    NoMaster,
    #[error("Clock sample is stale ({0} ns old)")]
    StaleSample(u64),
    #[error("Clock mutex busy")]
    MutexBusy,
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum CipherError {
    #[error("Packet too short for cipher framing: {0} bytes")]
    ShortPacket(usize),
    #[error("AEAD authentication failed")]
    Aead,
}

#[derive(Error, Debug, Diagnostic)]
pub enum DecodeError {
    #[error("Decoder error: {0}")]
    Decoder(String),
    #[error("Decoder produced {0} samples, expected {1}")]
    ShortOutput(usize, usize),
}

#[derive(Error, Debug, Diagnostic)]
pub enum StatsInternalError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Error in stats: {0}")]
    ChildAppError(#[from] ChildAppError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum PierreError {
    #[error("I/O error: {0}")]
    IoError(#[from] Box<io::Error>),
    #[error("Config error: {0}")]
    ConfigError(#[from] Box<ConfigError>),
    #[error(transparent)]
    PierreApiError(#[from] Box<PierreApiError>),
    #[error("Session API error: {0}")]
    SessionApiError(#[from] Box<SessionApiError>),
    #[error("Internal error: {0}")]
    PierreInternalError(#[from] Box<PierreInternalError>),
    #[error("Internal session error: {0}")]
    SessionInternalError(#[from] Box<SessionInternalError>),
    #[error("Internal render error: {0}")]
    RenderInternalError(#[from] Box<RenderInternalError>),
    #[error("Internal desk error: {0}")]
    DeskInternalError(#[from] Box<DeskInternalError>),
    #[error("Error in child app {0}: {1}")]
    ChildAppError(String, Box<dyn std::error::Error + Send + Sync>),
}

pub type PierreResult<T> = Result<T, PierreError>;
pub type PierreApiResult<T> = Result<T, PierreApiError>;
pub type SessionApiResult<T> = Result<T, SessionApiError>;
pub type PierreInternalResult<T> = Result<T, PierreInternalError>;
pub type SessionInternalResult<T> = Result<T, SessionInternalError>;
pub type RenderInternalResult<T> = Result<T, RenderInternalError>;
pub type DeskInternalResult<T> = Result<T, DeskInternalError>;
pub type StatsInternalResult<T> = Result<T, StatsInternalError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ClockResult<T> = Result<T, ClockError>;
pub type CipherResult<T> = Result<T, CipherError>;
pub type DecodeResult<T> = Result<T, DecodeError>;

pub trait ToBoxed {
    fn boxed(self) -> Box<Self>;
}

impl<T: std::error::Error> ToBoxed for T {
    fn boxed(self) -> Box<Self> {
        Box::new(self)
    }
}

pub trait ToBoxedResult<T, E: ToBoxed> {
    fn boxed(self) -> Result<T, Box<E>>;
}

impl<T, E: ToBoxed + std::error::Error> ToBoxedResult<T, E> for std::result::Result<T, E> {
    fn boxed(self) -> Result<T, Box<E>> {
        match self {
            Ok(it) => Ok(it),
            Err(err) => Err(err.boxed()),
        }
    }
}

impl From<SessionInternalError> for PierreApiError {
    fn from(value: SessionInternalError) -> Self {
        PierreApiError::Session(SessionApiError::Internal(value.boxed()).boxed())
    }
}

impl From<PierreInternalError> for PierreApiError {
    fn from(value: PierreInternalError) -> Self {
        PierreApiError::Internal(value.boxed())
    }
}
