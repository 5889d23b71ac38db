//! Movie summary email rendering.

use crate::collaborators::MovieInfo;
use reqwest::Url;
use serde::{Deserialize, Serialize};

const NOT_AVAILABLE: &str = "N/A";
const SEARCH_URL: &str = "https://www.google.com/search";

/// A rendered email, ready for an [`EmailSender`](crate::EmailSender).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Renders the summary email for a movie.
///
/// `requested_title` is the title from the event, used when the provider
/// returned an empty title.
pub fn render_movie_email(movie: &MovieInfo, summary: &str, requested_title: &str) -> RenderedEmail {
    let title = if movie.title.trim().is_empty() {
        requested_title
    } else {
        movie.title.as_str()
    };
    let subject = format!("Movie Summary: {title}");
    let html = render_html(movie, title, summary);
    let text = html_to_text(&html);
    RenderedEmail {
        subject,
        html,
        text,
    }
}

fn render_html(movie: &MovieInfo, title: &str, summary: &str) -> String {
    let mut html = String::with_capacity(4096);
    html.push_str("<html>\n<head>\n<style>\n");
    html.push_str(STYLE);
    html.push_str("</style>\n</head>\n<body>\n<div class=\"container\">\n");
    html.push_str(&format!("<h1>Movie Summary: {}</h1>\n", escape(title)));

    html.push_str("<div class=\"movie-card\">\n<div class=\"poster\">\n");
    html.push_str(&poster(movie.poster.as_deref()));
    html.push_str("\n</div>\n<div class=\"details\">\n<table class=\"info-table\">\n");
    for (label, value) in [
        ("Year", field(&movie.year)),
        ("Rated", field(&movie.rated)),
        ("Runtime", field(&movie.runtime)),
        ("Genre", field(&movie.genre)),
    ] {
        html.push_str(&format!(
            "<tr><td>{label}:</td><td>{}</td></tr>\n",
            escape(value)
        ));
    }
    html.push_str(&format!(
        "<tr><td>Director:</td><td>{}</td></tr>\n",
        search_links(movie.director.as_deref())
    ));
    html.push_str(&format!(
        "<tr><td>Actors:</td><td>{}</td></tr>\n",
        search_links(movie.actors.as_deref())
    ));
    html.push_str("</table>\n");
    html.push_str(&format!(
        "<div class=\"ratings\"><strong>Ratings:</strong><br>{}</div>\n",
        escape(&ratings(movie))
    ));
    html.push_str("</div>\n</div>\n");

    html.push_str("<div class=\"summary-section\">\n");
    html.push_str(&format!("<h2>Original Plot</h2>\n<p>{}</p>\n", escape(&movie.plot)));
    html.push_str(&format!("<h2>AI-Generated Summary</h2>\n<p>{}</p>\n", escape(summary)));
    html.push_str("</div>\n</div>\n</body>\n</html>\n");
    html
}

const STYLE: &str = "body { font-family: Arial, sans-serif; margin: 0; padding: 20px; color: #333; }
.container { max-width: 600px; margin: 0 auto; }
h1 { color: #2c3e50; }
.movie-card { display: flex; margin-bottom: 20px; }
.poster { margin-right: 20px; }
.poster img { max-width: 200px; border-radius: 4px; }
.details { flex: 1; }
.info-table { border-collapse: collapse; width: 100%; margin-top: 15px; }
.info-table td { padding: 8px; border-bottom: 1px solid #ddd; }
.ratings { margin-top: 15px; }
.summary-section { margin-top: 20px; background-color: #f9f9f9; padding: 15px; border-radius: 4px; }
a { color: #3498db; text-decoration: none; }
";

fn field(value: &Option<String>) -> &str {
    available(value.as_deref()).unwrap_or(NOT_AVAILABLE)
}

fn available(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != NOT_AVAILABLE)
}

fn poster(url: Option<&str>) -> String {
    match available(url) {
        Some(url) => format!("<img src=\"{}\" alt=\"Movie poster\">", escape(url)),
        None => "<div style=\"width:200px;height:300px;background:#eee;display:flex;\
                 align-items:center;justify-content:center;border-radius:4px;\">\
                 No poster available</div>"
            .to_string(),
    }
}

/// Links each comma-separated name to a web search for it.
fn search_links(names: Option<&str>) -> String {
    let Some(names) = available(names) else {
        return NOT_AVAILABLE.to_string();
    };
    names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            let query = format!("{name} movie");
            match Url::parse_with_params(SEARCH_URL, &[("q", query.as_str())]) {
                Ok(url) => format!(
                    "<a href=\"{}\" target=\"_blank\">{}</a>",
                    escape(url.as_str()),
                    escape(name)
                ),
                Err(_) => escape(name),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn ratings(movie: &MovieInfo) -> String {
    let mut parts = Vec::new();
    if let Some(imdb) = available(movie.imdb_rating.as_deref()) {
        parts.push(format!("IMDb: {imdb}"));
    }
    if let Some(metascore) = available(movie.metascore.as_deref()) {
        parts.push(format!("Metascore: {metascore}"));
    }
    if parts.is_empty() {
        "No ratings available".to_string()
    } else {
        parts.join(" | ")
    }
}

/// Escapes text for inclusion in HTML content and attribute values.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Plain-text alternative of an HTML body: drops the `<style>` block and
/// tags, decodes the entities [`escape`] produces and collapses whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        text.push(' ');
        let tail = &rest[start..];
        let skip_to = if tail.starts_with("<style") {
            tail.find("</style>").map(|end| end + "</style>".len())
        } else {
            tail.find('>').map(|end| end + 1)
        };
        match skip_to {
            Some(end) => rest = &tail[end..],
            None => {
                rest = "";
                break;
            }
        }
    }
    text.push_str(rest);

    let decoded = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
