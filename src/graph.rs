use std::io::Write;

use attohttpc::header::AUTHORIZATION;
use attohttpc::Response;
use attohttpc::Session;
use chrono::DateTime;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::de::IgnoredAny;
use serde::Deserialize;
use thiserror::Error;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Error)]
pub enum GraphError {
    /// Error reported by Graph itself, with its machine-readable code.
    #[error("{code}: {message}")]
    Provider {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Http(#[from] attohttpc::Error),
}

impl GraphError {
    fn from_response(resp: Response) -> Self {
        let status = resp.status();
        match resp.json_utf8::<ErrorResponse>() {
            Ok(body) => GraphError::Provider {
                status: status.as_u16(),
                code: body.error.code,
                message: body.error.message,
            },
            Err(_) => GraphError::Provider {
                status: status.as_u16(),
                code: status.as_u16().to_string(),
                message: status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::Provider { status: 404, .. })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub display_name: Option<String>,
}

impl Team {
    /// Display name, or the id when the team has none.
    pub fn name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.id,
        }
    }
}

/// Location of a team's document library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveRoot {
    pub drive_id: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Video,
    Folder,
    Other,
}

/// A file or folder as returned by Graph. Only the fields we use.
/// See https://learn.microsoft.com/graph/api/resources/driveitem
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub parent_reference: Option<ItemReference>,
    pub web_url: Option<String>,
    pub file_system_info: Option<FileSystemInfo>,
    /// Facets only matter by their presence.
    pub folder: Option<IgnoredAny>,
    pub video: Option<IgnoredAny>,
    pub file: Option<FileFacet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    pub drive_id: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    pub mime_type: Option<String>,
}

impl DriveItem {
    pub fn kind(&self) -> EntryKind {
        let video_mime = self
            .file
            .as_ref()
            .and_then(|f| f.mime_type.as_deref())
            .is_some_and(|mime| mime.starts_with("video/"));

        if self.video.is_some() || video_mime {
            EntryKind::Video
        } else if self.folder.is_some() {
            EntryKind::Folder
        } else {
            EntryKind::Other
        }
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.parent_reference.as_ref()?.path.as_deref()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.file_system_info.as_ref()?.last_modified_date_time
    }
}

/// Blocking Microsoft Graph client. The session carries the bearer token.
#[derive(Debug)]
pub struct GraphClient {
    base_url: String,
    sess: Session,
}

impl GraphClient {
    pub fn new<S: Into<String>>(base_url: S, token: &str) -> Result<Self, GraphError> {
        let mut sess = Session::new();
        sess.try_header(AUTHORIZATION, format!("Bearer {}", token))?;
        Ok(Self {
            base_url: base_url.into(),
            sess,
        })
    }

    pub fn joined_teams(&self) -> Result<Vec<Team>, GraphError> {
        self.get_all(format!("{}/me/joinedTeams", self.base_url))
    }

    /// Resolves the root of the team's document library. `None` when the
    /// team has no drive.
    pub fn drive_root(&self, team_id: &str) -> Result<Option<DriveRoot>, GraphError> {
        let url = format!("{}/groups/{}/drive/root", self.base_url, team_id);
        let root: DriveItem = match self.get(&url) {
            Ok(resp) => resp.json_utf8()?,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let drive_id = root.parent_reference.and_then(|r| r.drive_id);
        Ok(match drive_id {
            Some(drive_id) if !drive_id.is_empty() && !root.id.is_empty() => Some(DriveRoot {
                drive_id,
                item_id: root.id,
            }),
            _ => None,
        })
    }

    pub fn list_children(
        &self,
        drive_id: &str,
        item_id: &str,
    ) -> Result<Vec<DriveItem>, GraphError> {
        self.get_all(format!(
            "{}/drives/{}/items/{}/children",
            self.base_url, drive_id, item_id
        ))
    }

    /// Streams the item's content into `writer`, returning the byte count.
    pub fn fetch_content<W: Write>(
        &self,
        drive_id: &str,
        item_id: &str,
        writer: W,
    ) -> Result<u64, GraphError> {
        let url = format!(
            "{}/drives/{}/items/{}/content",
            self.base_url, drive_id, item_id
        );
        Ok(self.get(&url)?.write_to(writer)?)
    }

    fn get(&self, url: &str) -> Result<Response, GraphError> {
        let resp = self.sess.get(url).send()?;
        if resp.is_success() {
            Ok(resp)
        } else {
            Err(GraphError::from_response(resp))
        }
    }

    fn get_all<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>, GraphError> {
        let mut items = Vec::new();
        let mut next_link = url;

        loop {
            let page: Collection<T> = self.get(&next_link)?.json_utf8()?;
            items.extend(page.value);

            if let Some(next) = page.next_link {
                next_link = next;
            } else {
                break;
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod test {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn classify_drive_items() {
        let items: Vec<DriveItem> = serde_json::from_value(json!([
            { "id": "a", "name": "standup.mp4", "video": {}, "file": { "mimeType": "video/mp4" } },
            { "id": "b", "name": "Recordings", "folder": { "childCount": 2 } },
            { "id": "c", "name": "notes.docx", "file": { "mimeType": "application/msword" } },
            { "id": "d", "name": "odd", "video": { "duration": 1000 }, "folder": { "childCount": 0 } },
            { "id": "e", "name": "clip.webm", "file": { "mimeType": "video/webm" } },
            { "id": "f", "name": "empty" }
        ]))
        .unwrap();

        let kinds: Vec<_> = items.iter().map(DriveItem::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Video,
                EntryKind::Folder,
                EntryKind::Other,
                EntryKind::Video,
                EntryKind::Video,
                EntryKind::Other,
            ]
        );
    }

    #[test]
    fn parse_drive_item_timestamps() {
        let item: DriveItem = serde_json::from_value(json!({
            "id": "a",
            "name": "standup.mp4",
            "parentReference": { "driveId": "d1", "path": "/drives/d1/root:/Recordings" },
            "fileSystemInfo": {
                "createdDateTime": "2024-03-01T09:00:00Z",
                "lastModifiedDateTime": "2024-03-01T10:00:00.5Z"
            }
        }))
        .unwrap();

        assert_eq!(item.parent_path(), Some("/drives/d1/root:/Recordings"));
        let modified = item.last_modified().unwrap();
        assert_eq!(modified.timestamp(), 1709287200);
        assert_eq!(modified.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn team_name_falls_back_to_id() {
        let named = Team {
            id: "t1".to_string(),
            display_name: Some("Engineering".to_string()),
        };
        let blank = Team {
            id: "t2".to_string(),
            display_name: Some("  ".to_string()),
        };
        assert_eq!(named.name(), "Engineering");
        assert_eq!(blank.name(), "t2");
    }

    #[test]
    fn joined_teams_follows_next_link() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/me/joinedTeams")
                .header("authorization", "Bearer secret");
            then.status(200).json_body(json!({
                "value": [{ "id": "t1", "displayName": "Engineering" }],
                "@odata.nextLink": server.url("/me/joinedTeams/page2")
            }));
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/me/joinedTeams/page2")
                .header("authorization", "Bearer secret");
            then.status(200).json_body(json!({
                "value": [{ "id": "t2", "displayName": "Sales" }]
            }));
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        let teams = client.joined_teams().unwrap();

        first.assert();
        second.assert();
        let names: Vec<_> = teams.iter().map(Team::name).collect();
        assert_eq!(names, vec!["Engineering", "Sales"]);
    }

    #[test]
    fn provider_error_carries_code_and_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/drives/d1/items/f1/children");
            then.status(403).json_body(json!({
                "error": { "code": "accessDenied", "message": "Access denied" }
            }));
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        let err = client.list_children("d1", "f1").unwrap_err();

        assert!(matches!(
            &err,
            GraphError::Provider { status: 403, code, .. } if code == "accessDenied"
        ));
        assert_eq!(err.to_string(), "accessDenied: Access denied");
    }

    #[test]
    fn unparsable_error_body_uses_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/me/joinedTeams");
            then.status(502).body("bad gateway");
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        let err = client.joined_teams().unwrap_err();

        assert_eq!(err.to_string(), "502: Bad Gateway");
    }

    #[test]
    fn drive_root_resolves_ids() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/groups/t1/drive/root");
            then.status(200).json_body(json!({
                "id": "root1",
                "name": "root",
                "parentReference": { "driveId": "d1" },
                "folder": { "childCount": 3 }
            }));
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        assert_eq!(
            client.drive_root("t1").unwrap(),
            Some(DriveRoot {
                drive_id: "d1".to_string(),
                item_id: "root1".to_string(),
            })
        );
    }

    #[test]
    fn missing_drive_is_not_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/groups/t1/drive/root");
            then.status(404).json_body(json!({
                "error": { "code": "itemNotFound", "message": "Not found" }
            }));
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        assert_eq!(client.drive_root("t1").unwrap(), None);
    }

    #[test]
    fn fetch_content_streams_bytes() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.path("/drives/d1/items/v1/content");
            then.status(200).body("recording");
        });

        let client = GraphClient::new(server.base_url(), "secret").unwrap();
        let mut buf = Vec::new();
        let len = client.fetch_content("d1", "v1", &mut buf).unwrap();

        m.assert();
        assert_eq!(len, 9);
        assert_eq!(buf, b"recording");
    }
}
