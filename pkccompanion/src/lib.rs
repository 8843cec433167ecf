//! # pkccompanion
//!
//! Plex companion ("remote control") support for a Kodi based player.
//!
//! The crate lets Plex controllers (phone apps, web app, voice assistants)
//! discover this player on the local network, send it playback commands and
//! receive timeline updates about what it is playing.
//!
//! ## Parts
//!
//! - [`discovery`]: GDM UDP registration, server discovery and search replies
//! - [`listener`]: the companion HTTP routes, turning requests into [`Task`]s
//! - [`subscribers`]: timeline subscribers and push delivery
//! - [`dispatcher`]: executes tasks against the media server and the player
//! - [`playqueue`]: local mirrors of the server's play queues
//! - [`service`]: the loop tying everything together
//!
//! The media server and the local player are reached through the
//! [`MediaServerApi`] and [`Player`] traits; [`pms::PlexServerClient`] and
//! [`kodi::KodiClient`] are the HTTP implementations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pkcconfig::get_config;
//! use pkccompanion::{CompanionConfigExt, CompanionService, kodi::KodiClient, pms::PlexServerClient};
//!
//! let settings = get_config().get_companion_settings()?;
//! let kodi = Arc::new(KodiClient::new(&settings.kodi));
//! let server = Arc::new(PlexServerClient::new(
//!     settings.identity.clone(),
//!     settings.server_token.clone(),
//!     settings.server_timeout,
//! ));
//! let service = CompanionService::new(settings, server, kodi.clone(), kodi)?;
//! service.run();
//! ```

pub mod collaborators;
pub mod config_ext;
pub mod context;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod kodi;
pub mod listener;
pub mod model;
pub mod playqueue;
pub mod pms;
pub mod service;
pub mod subscribers;
pub mod tasks;
pub mod timeline;

#[cfg(test)]
mod testing;

pub use collaborators::{LogNotifier, MediaServerApi, Notifier, Player};
pub use config_ext::{CompanionConfigExt, CompanionSettings};
pub use context::ServiceContext;
pub use errors::{CompanionError, Result};
pub use model::MediaKind;
pub use service::{CompanionHandle, CompanionService};
pub use tasks::Task;
