//! `mxc://` content URIs and the homeserver URLs that serve them.

use std::fmt;

use sync_core::{SyncError, SyncErrorCategory};
use sync_worker::parse_homeserver_url;
use url::Url;

/// A parsed `mxc://<server-name>/<media-id>` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MxcUri {
    pub server_name: String,
    pub media_id: String,
}

impl MxcUri {
    pub fn parse(uri: &str) -> Result<Self, SyncError> {
        let rest = uri
            .strip_prefix("mxc://")
            .ok_or_else(|| invalid_mxc(uri, "missing mxc:// scheme"))?;
        let (server_name, media_id) = rest
            .split_once('/')
            .ok_or_else(|| invalid_mxc(uri, "missing media id"))?;

        if server_name.is_empty() || media_id.is_empty() || media_id.contains('/') {
            return Err(invalid_mxc(uri, "expected mxc://<server-name>/<media-id>"));
        }
        Ok(Self {
            server_name: server_name.to_owned(),
            media_id: media_id.to_owned(),
        })
    }
}

impl fmt::Display for MxcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.server_name, self.media_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThumbnailMethod {
    #[default]
    Crop,
    Scale,
}

impl ThumbnailMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Scale => "scale",
        }
    }
}

/// Builds media URLs for one homeserver. Holds no credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRepository {
    homeserver: Url,
}

impl MediaRepository {
    pub fn new(homeserver: &str) -> Result<Self, SyncError> {
        Ok(Self {
            homeserver: parse_homeserver_url(homeserver)?,
        })
    }

    pub fn download_url(&self, uri: &str) -> Result<Url, SyncError> {
        let mxc = MxcUri::parse(uri)?;
        self.media_url("download", &mxc)
    }

    pub fn thumbnail_url(
        &self,
        uri: &str,
        width: u32,
        height: u32,
        method: ThumbnailMethod,
    ) -> Result<Url, SyncError> {
        let mxc = MxcUri::parse(uri)?;
        let mut url = self.media_url("thumbnail", &mxc)?;
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("method", method.as_str());
        Ok(url)
    }

    fn media_url(&self, kind: &str, mxc: &MxcUri) -> Result<Url, SyncError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_homeserver_url",
                    format!("homeserver url '{}' cannot be a base", self.homeserver),
                )
            })?
            .pop_if_empty()
            .extend(["_matrix", "media", "v3", kind])
            .extend([mxc.server_name.as_str(), mxc.media_id.as_str()]);
        Ok(url)
    }
}

fn invalid_mxc(uri: &str, reason: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Config,
        "invalid_mxc_uri",
        format!("invalid content uri '{uri}': {reason}"),
    )
}
