//! Configuration management for the vendor-specific client.
//!
//! This module handles loading and saving configuration from disk: where the
//! vendor service lives on D-Bus, where this client exports its relay, and an
//! optional event filter to install once a session is ready.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{Result, VsError},
   vendor::EventFilter,
};

/// Message bus hosting the vendor service.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BusKind {
   #[default]
   System,
   Session,
}

/// Main configuration structure for the client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default)]
   pub bus: BusKind,

   #[serde(default = "default_service_name")]
   pub service_name: SmolStr,

   #[serde(default = "default_object_path")]
   pub object_path: SmolStr,

   #[serde(default = "default_callback_path_prefix")]
   pub callback_path_prefix: SmolStr,

   #[serde(default)]
   pub event_filter: Option<FilterConfig>,
}

/// Event filter written as hex strings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FilterConfig {
   pub mask: String,
   pub value: String,
}

impl FilterConfig {
   /// Decodes the filter, rejecting masks and values of different lengths.
   pub fn to_filter(&self) -> Result<EventFilter> {
      let mask = hex::decode(self.mask.trim())?;
      let value = hex::decode(self.value.trim())?;
      if mask.len() != value.len() {
         return Err(VsError::InvalidFilter(format!(
            "mask is {} bytes but value is {} bytes",
            mask.len(),
            value.len()
         )));
      }
      Ok(EventFilter::new(&mask, &value))
   }
}

fn default_service_name() -> SmolStr {
   SmolStr::new_static("org.btvs.VendorService")
}

fn default_object_path() -> SmolStr {
   SmolStr::new_static("/org/btvs/vendor")
}

fn default_callback_path_prefix() -> SmolStr {
   SmolStr::new_static("/org/btvs/client")
}

impl Default for Config {
   fn default() -> Self {
      Self {
         bus: BusKind::default(),
         service_name: default_service_name(),
         object_path: default_object_path(),
         callback_path_prefix: default_callback_path_prefix(),
         event_filter: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing defaults there if missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(btvs_home) = env::var("BTVS_HOME") {
         PathBuf::from(btvs_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(VsError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("btvs").join("config.toml"))
   }

   /// The configured event filter, if any.
   pub fn event_filter(&self) -> Result<Option<EventFilter>> {
      self.event_filter.as_ref().map(FilterConfig::to_filter).transpose()
   }
}
