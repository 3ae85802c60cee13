//! Batching of channel sources into download groups.
//!
//! Channels with identical effective settings (quality, subfolder, content
//! filters) can share a single yt-dlp invocation. Each group carries the
//! output templates and command options for its batch.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::core::ratings;
use crate::download::command_builder::{
    CommandOptions, MatchFilterOptions, VideoCodec, CHANNEL_TEMPLATE, VIDEO_FILE_TEMPLATE, VIDEO_FOLDER_TEMPLATE,
};

/// Subfolder sentinel meaning "use the globally configured default".
pub const USE_GLOBAL_DEFAULT_SENTINEL: &str = "##USE_GLOBAL_DEFAULT##";

/// Per-channel content filter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelFilterConfig {
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub title_filter: Option<String>,
    pub audio_format: Option<String>,
    pub skip_video_folder: bool,
}

impl ChannelFilterConfig {
    pub fn from_channel(channel: &ChannelSource) -> Self {
        Self {
            min_duration: channel.min_duration,
            max_duration: channel.max_duration,
            title_filter: channel.title_filter.clone(),
            audio_format: channel.audio_format.clone(),
            skip_video_folder: channel.skip_video_folder,
        }
    }

    /// Grouping key for this filter combination. JSON so that absent values
    /// cannot collide with legitimate sentinel strings.
    pub fn filter_key(&self) -> String {
        json!({
            "min": self.min_duration,
            "max": self.max_duration,
            "title": self.title_filter,
            "audio": self.audio_format,
            "skipVF": self.skip_video_folder,
        })
        .to_string()
    }

    pub fn has_filters(&self) -> bool {
        self.min_duration.is_some()
            || self.max_duration.is_some()
            || self.title_filter.is_some()
            || self.audio_format.is_some()
            || self.skip_video_folder
    }
}

/// One enabled channel with its download settings.
#[derive(Debug, Clone)]
pub struct ChannelSource {
    pub channel_id: String,
    pub url: String,
    pub sub_folder: Option<String>,
    pub video_quality: Option<String>,
    pub video_codec: Option<String>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub title_filter: Option<String>,
    pub audio_format: Option<String>,
    pub skip_video_folder: bool,
}

/// Channels sharing one yt-dlp invocation, with resolved settings and
/// staging-rooted output templates.
#[derive(Debug, Clone)]
pub struct DownloadGroup {
    pub quality: String,
    pub sub_folder: Option<String>,
    pub filter: ChannelFilterConfig,
    pub channels: Vec<ChannelSource>,
    pub output_template: String,
    pub thumbnail_template: String,
}

impl DownloadGroup {
    pub fn channel_urls(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.url.as_str()).collect()
    }

    /// Command options for this group's invocation. `max_content_rating`
    /// is the configured ceiling (e.g. "TV-14"); unknown ratings apply no
    /// age filter.
    pub fn command_options(&self, max_content_rating: Option<&str>) -> CommandOptions {
        let codec = self
            .channels
            .first()
            .and_then(|c| c.video_codec.as_deref())
            .map(VideoCodec::parse)
            .unwrap_or_default();

        CommandOptions {
            resolution: self.quality.clone(),
            video_codec: codec,
            audio_only: self.filter.audio_format.is_some(),
            filter: MatchFilterOptions {
                min_duration_secs: self.filter.min_duration,
                max_duration_secs: self.filter.max_duration,
                title_filter: self.filter.title_filter.clone(),
                max_age_limit: max_content_rating.and_then(ratings::age_limit_for_rating),
            },
            subfolder: self.sub_folder.clone(),
            output_template: Some(self.output_template.clone()),
            thumbnail_template: Some(self.thumbnail_template.clone()),
            ..CommandOptions::default()
        }
    }
}

/// Groups channels for batch downloads.
#[derive(Debug, Clone)]
pub struct Grouper {
    staging_base: PathBuf,
    global_quality: String,
    default_subfolder: Option<String>,
}

impl Grouper {
    pub fn new(staging_base: impl Into<PathBuf>, global_quality: impl Into<String>, default_subfolder: Option<String>) -> Self {
        Self {
            staging_base: staging_base.into(),
            global_quality: global_quality.into(),
            default_subfolder,
        }
    }

    /// Sentinel resolves to the global default, absent means library root.
    fn resolve_subfolder(&self, sub_folder: Option<&str>) -> Option<String> {
        match sub_folder.map(str::trim) {
            Some(USE_GLOBAL_DEFAULT_SENTINEL) => self.default_subfolder.clone(),
            Some("") | None => None,
            Some(sub) => Some(sub.to_string()),
        }
    }

    fn templates(&self, sub_folder: Option<&str>, skip_video_folder: bool) -> (String, String) {
        let base = match sub_folder {
            Some(sub) => format!("{}/{}", self.staging_base.display(), sub.trim_matches('/')),
            None => self.staging_base.display().to_string(),
        };

        if skip_video_folder {
            // Flat layout: videos directly under the channel directory.
            (
                format!("{}/{}/{}", base, CHANNEL_TEMPLATE, VIDEO_FILE_TEMPLATE),
                format!("{}/{}/%(title)s - %(id)s-poster", base, CHANNEL_TEMPLATE),
            )
        } else {
            (
                format!("{}/{}/{}/{}", base, CHANNEL_TEMPLATE, VIDEO_FOLDER_TEMPLATE, VIDEO_FILE_TEMPLATE),
                format!("{}/{}/{}/poster", base, CHANNEL_TEMPLATE, VIDEO_FOLDER_TEMPLATE),
            )
        }
    }

    fn build_group(&self, quality: String, sub_folder: Option<String>, filter: ChannelFilterConfig) -> DownloadGroup {
        let (output_template, thumbnail_template) = self.templates(sub_folder.as_deref(), filter.skip_video_folder);
        DownloadGroup {
            quality,
            sub_folder,
            filter,
            channels: Vec::new(),
            output_template,
            thumbnail_template,
        }
    }

    /// Group by effective quality, subfolder and filters. Insertion order
    /// of first occurrence is preserved.
    pub fn group_channels(&self, channels: &[ChannelSource]) -> Vec<DownloadGroup> {
        let mut keys: Vec<String> = Vec::new();
        let mut groups: Vec<DownloadGroup> = Vec::new();

        for channel in channels {
            let quality = channel
                .video_quality
                .clone()
                .unwrap_or_else(|| self.global_quality.clone());
            let sub_folder = self.resolve_subfolder(channel.sub_folder.as_deref());
            let filter = ChannelFilterConfig::from_channel(channel);

            let key = format!(
                "{}|{}|{}",
                quality,
                sub_folder.as_deref().unwrap_or("root"),
                filter.filter_key()
            );

            let index = match keys.iter().position(|k| k == &key) {
                Some(index) => index,
                None => {
                    keys.push(key);
                    groups.push(self.build_group(quality, sub_folder, filter));
                    groups.len() - 1
                }
            };
            groups[index].channels.push(channel.clone());
        }

        groups
    }

    /// Group ignoring per-channel quality, for runs with a quality
    /// override. Content filters still apply.
    pub fn group_by_subfolder_only(&self, channels: &[ChannelSource], override_quality: &str) -> Vec<DownloadGroup> {
        let mut keys: Vec<String> = Vec::new();
        let mut groups: Vec<DownloadGroup> = Vec::new();

        for channel in channels {
            let sub_folder = self.resolve_subfolder(channel.sub_folder.as_deref());
            let filter = ChannelFilterConfig::from_channel(channel);

            let key = format!("{}|{}", sub_folder.as_deref().unwrap_or("root"), filter.filter_key());

            let index = match keys.iter().position(|k| k == &key) {
                Some(index) => index,
                None => {
                    keys.push(key);
                    groups.push(self.build_group(override_quality.to_string(), sub_folder, filter));
                    groups.len() - 1
                }
            };
            groups[index].channels.push(channel.clone());
        }

        groups
    }

    pub fn staging_base(&self) -> &Path {
        &self.staging_base
    }
}
