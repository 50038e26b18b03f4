use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::errors::AppResult;
use crate::uploader::types::UploadOutcome;

/// Everything a renderer needs to format one group's results.
#[derive(Debug, Clone)]
pub struct GroupOutputContext {
    pub gallery_name: String,
    pub gallery_id: Option<String>,
    pub gallery_link: Option<String>,
    pub cover_url: Option<String>,
    pub images: Vec<UploadOutcome>,
}

/// Formats a finished group into postable text.
pub trait OutputRenderer: Send + Sync {
    fn render(&self, ctx: &GroupOutputContext) -> String;

    fn extension(&self) -> &str {
        "txt"
    }
}

/// Forum BBCode: each image is a thumbnail linking to the full view.
pub struct BbcodeRenderer;

impl OutputRenderer for BbcodeRenderer {
    fn render(&self, ctx: &GroupOutputContext) -> String {
        let mut out = String::new();
        if let Some(link) = &ctx.gallery_link {
            out.push_str(&format!("[b]{}[/b]\n[url]{}[/url]\n\n", ctx.gallery_name, link));
        } else {
            out.push_str(&format!("[b]{}[/b]\n\n", ctx.gallery_name));
        }
        for image in &ctx.images {
            out.push_str(&format!(
                "[url={}][img]{}[/img][/url]\n",
                image.image_url, image.thumb_url
            ));
        }
        out
    }
}

/// One direct image URL per line.
pub struct PlainRenderer;

impl OutputRenderer for PlainRenderer {
    fn render(&self, ctx: &GroupOutputContext) -> String {
        let mut out = String::new();
        if let Some(link) = &ctx.gallery_link {
            out.push_str(link);
            out.push('\n');
        }
        for image in &ctx.images {
            out.push_str(&image.image_url);
            out.push('\n');
        }
        out
    }
}

/// Public gallery page for a service, when the URL shape is known.
pub fn gallery_link(service: &str, gallery_id: &str) -> Option<String> {
    if gallery_id.is_empty() {
        return None;
    }
    let service = service.to_lowercase();
    let link = match service.as_str() {
        "pixhost" | "pixhost.to" => format!("https://pixhost.to/gallery/{}", gallery_id),
        "imgur" => format!("https://imgur.com/a/{}", gallery_id),
        "imx.to" => format!("https://imx.to/g/{}", gallery_id),
        "vipr.im" => format!("https://vipr.im/f/{}", gallery_id),
        "turboimagehost" => format!("https://www.turboimagehost.com/g/{}", gallery_id),
        _ => return None,
    };
    Some(link)
}

/// Strip characters that are unsafe in filenames and cap the length.
pub fn safe_filename(title: &str, max_length: usize) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim();
    let name: String = trimmed.chars().take(max_length).collect();
    if name.is_empty() {
        "untitled".to_string()
    } else {
        name
    }
}

/// Render the group and write it to `<output_dir>/<title>_<timestamp>.<ext>`.
pub fn write_group_output(
    output_dir: &Path,
    ctx: &GroupOutputContext,
    renderer: &dyn OutputRenderer,
) -> AppResult<PathBuf> {
    fs::create_dir_all(output_dir)?;

    let text = renderer.render(ctx);
    let safe_title = safe_filename(&ctx.gallery_name, 50);
    let timestamp = Local::now().format("%Y%m%d_%H%M");
    let path = output_dir.join(format!("{}_{}.{}", safe_title, timestamp, renderer.extension()));

    fs::write(&path, text)?;
    log::info!("Generated output: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> GroupOutputContext {
        GroupOutputContext {
            gallery_name: "Summer Trip".to_string(),
            gallery_id: Some("abc123".to_string()),
            gallery_link: gallery_link("Pixhost", "abc123"),
            cover_url: Some("https://img.test/a.jpg".to_string()),
            images: vec![
                UploadOutcome {
                    path: PathBuf::from("a.jpg"),
                    image_url: "https://img.test/a.jpg".to_string(),
                    thumb_url: "https://img.test/t/a.jpg".to_string(),
                },
                UploadOutcome {
                    path: PathBuf::from("b.jpg"),
                    image_url: "https://img.test/b.jpg".to_string(),
                    thumb_url: "https://img.test/t/b.jpg".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_gallery_links() {
        assert_eq!(
            gallery_link("Pixhost", "g1").as_deref(),
            Some("https://pixhost.to/gallery/g1")
        );
        assert_eq!(
            gallery_link("imgur", "a9").as_deref(),
            Some("https://imgur.com/a/a9")
        );
        assert_eq!(gallery_link("Catbox", "x"), None);
        assert_eq!(gallery_link("Pixhost", ""), None);
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("My Trip: Part 2!", 50), "My Trip_ Part 2_");
        assert_eq!(safe_filename("", 50), "untitled");
        assert_eq!(safe_filename("abcdef", 3), "abc");
    }

    #[test]
    fn test_bbcode_render() {
        let text = BbcodeRenderer.render(&ctx());
        assert!(text.contains("[b]Summer Trip[/b]"));
        assert!(text.contains("[url]https://pixhost.to/gallery/abc123[/url]"));
        assert!(text.contains("[url=https://img.test/a.jpg][img]https://img.test/t/a.jpg[/img][/url]"));
    }

    #[test]
    fn test_write_group_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_group_output(dir.path(), &ctx(), &PlainRenderer).unwrap();
        assert!(path.exists());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("https://img.test/a.jpg"));
        assert!(text.contains("https://pixhost.to/gallery/abc123"));
    }
}
