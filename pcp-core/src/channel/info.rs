//! Channel metadata carried in `CHAN_INFO` and `CHAN_TRACK`.

use {
    crate::atom::{define::name, Atom},
    serde::Serialize,
};

fn merge_extra(extra: &mut Vec<Atom>, child: &Atom) {
    match extra.iter_mut().find(|a| a.name() == child.name()) {
        Some(existing) => *existing = child.clone(),
        None => extra.push(child.clone()),
    }
}

fn push_string(children: &mut Vec<Atom>, atom_name: crate::atom::AtomName, value: &str) {
    if !value.is_empty() {
        children.push(Atom::with_string(atom_name, value));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub genre: String,
    pub description: String,
    pub comment: String,
    pub url: String,
    pub bitrate: u32,
    /// Container name, e.g. `FLV`.
    pub content_type: String,
    pub mime_type: String,
    pub extension: String,
    #[serde(skip)]
    pub extra: Vec<Atom>,
}

impl ChannelInfo {
    #[must_use]
    pub fn from_atom(atom: &Atom) -> Self {
        let mut info = Self::default();
        info.merge_atom(atom);
        info
    }

    /// Overwrite every attribute present in `atom`. Returns whether anything changed.
    pub fn merge_atom(&mut self, atom: &Atom) -> bool {
        let before = self.clone();
        for child in atom.children() {
            let n = child.name();
            let text = || child.as_string().unwrap_or_default();
            if n == name::CHAN_INFO_NAME {
                self.name = text();
            } else if n == name::CHAN_INFO_GENRE {
                self.genre = text();
            } else if n == name::CHAN_INFO_DESC {
                self.description = text();
            } else if n == name::CHAN_INFO_COMMENT {
                self.comment = text();
            } else if n == name::CHAN_INFO_URL {
                self.url = text();
            } else if n == name::CHAN_INFO_TYPE {
                self.content_type = text();
            } else if n == name::CHAN_INFO_STREAM_TYPE {
                self.mime_type = text();
            } else if n == name::CHAN_INFO_STREAM_EXT {
                self.extension = text();
            } else if n == name::CHAN_INFO_BITRATE {
                self.bitrate = child.as_u32().unwrap_or(0);
            } else {
                merge_extra(&mut self.extra, child);
            }
        }
        *self != before
    }

    #[must_use]
    pub fn to_atom(&self) -> Atom {
        let mut children = Vec::new();
        push_string(&mut children, name::CHAN_INFO_NAME, &self.name);
        children.push(Atom::with_u32(name::CHAN_INFO_BITRATE, self.bitrate));
        push_string(&mut children, name::CHAN_INFO_GENRE, &self.genre);
        push_string(&mut children, name::CHAN_INFO_URL, &self.url);
        push_string(&mut children, name::CHAN_INFO_DESC, &self.description);
        push_string(&mut children, name::CHAN_INFO_COMMENT, &self.comment);
        push_string(&mut children, name::CHAN_INFO_TYPE, &self.content_type);
        push_string(&mut children, name::CHAN_INFO_STREAM_TYPE, &self.mime_type);
        push_string(&mut children, name::CHAN_INFO_STREAM_EXT, &self.extension);
        children.extend(self.extra.iter().cloned());
        Atom::with_children(name::CHAN_INFO, children)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTrack {
    pub title: String,
    pub creator: String,
    pub album: String,
    pub genre: String,
    pub url: String,
    #[serde(skip)]
    pub extra: Vec<Atom>,
}

impl ChannelTrack {
    #[must_use]
    pub fn from_atom(atom: &Atom) -> Self {
        let mut track = Self::default();
        track.merge_atom(atom);
        track
    }

    pub fn merge_atom(&mut self, atom: &Atom) -> bool {
        let before = self.clone();
        for child in atom.children() {
            let n = child.name();
            let text = || child.as_string().unwrap_or_default();
            if n == name::CHAN_TRACK_TITLE {
                self.title = text();
            } else if n == name::CHAN_TRACK_CREATOR {
                self.creator = text();
            } else if n == name::CHAN_TRACK_ALBUM {
                self.album = text();
            } else if n == name::CHAN_TRACK_GENRE {
                self.genre = text();
            } else if n == name::CHAN_TRACK_URL {
                self.url = text();
            } else {
                merge_extra(&mut self.extra, child);
            }
        }
        *self != before
    }

    #[must_use]
    pub fn to_atom(&self) -> Atom {
        let mut children = Vec::new();
        push_string(&mut children, name::CHAN_TRACK_TITLE, &self.title);
        push_string(&mut children, name::CHAN_TRACK_CREATOR, &self.creator);
        push_string(&mut children, name::CHAN_TRACK_URL, &self.url);
        push_string(&mut children, name::CHAN_TRACK_ALBUM, &self.album);
        push_string(&mut children, name::CHAN_TRACK_GENRE, &self.genre);
        children.extend(self.extra.iter().cloned());
        Atom::with_children(name::CHAN_TRACK, children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomName;

    #[test]
    fn test_info_merge_is_partial() {
        let mut info = ChannelInfo {
            name: "night radio".into(),
            genre: "ambient".into(),
            bitrate: 128,
            ..Default::default()
        };
        let update = Atom::with_children(
            name::CHAN_INFO,
            vec![
                Atom::with_string(name::CHAN_INFO_GENRE, "jazz"),
                Atom::with_u32(name::CHAN_INFO_BITRATE, 320),
                Atom::with_string(AtomName::new(b"gimp"), "future"),
            ],
        );
        assert!(info.merge_atom(&update));
        assert_eq!(info.name, "night radio");
        assert_eq!(info.genre, "jazz");
        assert_eq!(info.bitrate, 320);
        assert_eq!(info.extra.len(), 1);
        // identical update changes nothing
        assert!(!info.merge_atom(&update));
        assert_eq!(info.extra.len(), 1);
    }

    #[test]
    fn test_info_to_atom_carries_extras() {
        let mut info = ChannelInfo {
            name: "ch".into(),
            content_type: "FLV".into(),
            mime_type: "video/x-flv".into(),
            extension: ".flv".into(),
            ..Default::default()
        };
        info.extra
            .push(Atom::with_u8(AtomName::new(b"zzzz"), 7));
        let parsed = ChannelInfo::from_atom(&info.to_atom());
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_track_from_atom() {
        let atom = Atom::with_children(
            name::CHAN_TRACK,
            vec![
                Atom::with_string(name::CHAN_TRACK_TITLE, "song"),
                Atom::with_string(name::CHAN_TRACK_CREATOR, "band"),
                Atom::with_value(name::CHAN_TRACK_ALBUM, b"no nul".to_vec()),
            ],
        );
        let track = ChannelTrack::from_atom(&atom);
        assert_eq!(track.title, "song");
        assert_eq!(track.creator, "band");
        // malformed strings degrade to empty
        assert!(track.album.is_empty());
        assert_eq!(ChannelTrack::from_atom(&track.to_atom()), track);
    }
}
