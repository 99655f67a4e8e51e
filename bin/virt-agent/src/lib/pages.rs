// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static content: the landing page, API documentation, and the icon.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// A static file, read fresh on every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticFile {
    Landing,
    ApiOverview,
    ApiV1,
    Favicon,
}

impl StaticFile {
    fn location(&self) -> (Location, &'static str) {
        match self {
            StaticFile::Landing => (Location::Pages, "landing.html"),
            StaticFile::ApiOverview => (Location::Pages, "api.html"),
            StaticFile::ApiV1 => (Location::Pages, "apiv1.html"),
            StaticFile::Favicon => (Location::Resources, "favicon.ico"),
        }
    }
}

enum Location {
    Pages,
    Resources,
}

/// File contents along with their media type.
#[derive(Clone, Debug)]
pub struct Content {
    pub media_type: &'static str,
    pub body: Bytes,
}

/// Media type to serve a file as, keyed on its extension.
pub fn media_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("ico") => "image/x-icon",
        Some("css") => "text/css",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Serves [`StaticFile`]s out of the configured directories.
#[derive(Clone, Debug)]
pub struct Pages {
    pages_dir: PathBuf,
    resources_dir: PathBuf,
}

impl Pages {
    pub fn new(
        pages_dir: impl Into<PathBuf>,
        resources_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pages_dir: pages_dir.into(),
            resources_dir: resources_dir.into(),
        }
    }

    pub fn path(&self, file: StaticFile) -> PathBuf {
        let (location, name) = file.location();
        match location {
            Location::Pages => self.pages_dir.join(name),
            Location::Resources => self.resources_dir.join(name),
        }
    }

    pub async fn read(&self, file: StaticFile) -> io::Result<Content> {
        let path = self.path(file);
        let body = tokio::fs::read(&path).await?;
        Ok(Content { media_type: media_type(&path), body: body.into() })
    }
}

impl From<&virt_agent_config::Content> for Pages {
    fn from(cfg: &virt_agent_config::Content) -> Self {
        Self::new(&cfg.pages_dir, &cfg.resources_dir)
    }
}
