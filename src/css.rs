//! Stylesheets and the URLs inside them
//!
//! A [Stylesheet] is kept as decoded text. URLs are located with the
//! `cssparser` tokenizer, which means comments and strings that merely look
//! like `url(...)` are never mistaken for references. Rewriting splices the
//! replacement into the original text, so everything else in the stylesheet
//! is preserved byte for byte.

use cssparser::{ParseError, Parser, ParserInput, Token};

/// A parsed CSS stylesheet
#[derive(Debug, Clone, PartialEq)]
pub struct Stylesheet {
    pub text: String,
}

/// A URL reference found in CSS text
#[derive(Debug, Clone, PartialEq)]
pub struct CssUrl {
    /// The unescaped URL
    pub url: String,

    /// Byte range of the whole token (`url(...)` or the `@import` string)
    pub start: usize,
    pub end: usize,

    /// 1-based line of the token
    pub line: usize,

    /// Byte offset of the token inside its line
    pub offset: usize,

    form: UrlForm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UrlForm {
    /// `url(foo.png)`
    Unquoted,

    /// `url("foo.png")` with the given quote
    QuotedFunction(char),

    /// `@import "foo.css"` with the given quote
    ImportString(char),
}

impl Stylesheet {
    pub fn new(text: String) -> Self {
        Self { text }
    }

    /// All URLs referenced by the stylesheet, in source order
    pub fn urls(&self) -> Vec<CssUrl> {
        css_urls(&self.text)
    }

    /// Replaces URLs for which `replace` returns a different value
    ///
    /// Returns the number of replaced URLs.
    pub fn rewrite_urls(&mut self, replace: &mut dyn FnMut(&str) -> Option<String>) -> usize {
        let (text, count) = rewrite_css_urls(&self.text, replace);
        if count > 0 {
            self.text = text;
        }
        count
    }

    /// Serializes the stylesheet as UTF-8
    ///
    /// A leading `@charset` rule is rewritten to declare UTF-8, since the text
    /// was decoded when the stylesheet was loaded.
    pub fn serialize(&self) -> Vec<u8> {
        let text = self.text.trim_start_matches('\u{FEFF}');
        if let Some(rest) = text.strip_prefix("@charset ") {
            if let Some(end) = rest.find(';') {
                return format!("@charset \"utf-8\";{}", &rest[end + 1..]).into_bytes();
            }
        }
        text.as_bytes().to_vec()
    }
}

/// Finds every `url()` and `@import` string in CSS text
///
/// The text may be a full stylesheet or the value of a `style` attribute.
pub fn css_urls(text: &str) -> Vec<CssUrl> {
    let mut input = ParserInput::new(text);
    let mut parser = Parser::new(&mut input);
    let mut urls = Vec::new();
    collect_urls(&mut parser, text, &mut urls);

    let line_starts = std::iter::once(0)
        .chain(text.match_indices('\n').map(|(index, _)| index + 1))
        .collect::<Vec<_>>();

    for url in &mut urls {
        let line = line_starts.partition_point(|&start| start <= url.start);
        url.line = line;
        url.offset = url.start - line_starts[line - 1];
    }
    urls
}

/// Rewrites the URLs of CSS text
///
/// `replace` receives each URL and returns the new value, or `None` to keep
/// it. Returns the new text and the number of URLs that changed.
pub fn rewrite_css_urls(
    text: &str,
    replace: &mut dyn FnMut(&str) -> Option<String>,
) -> (String, usize) {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;

    for url in css_urls(text) {
        let Some(new_url) = replace(&url.url) else {
            continue;
        };
        if new_url == url.url {
            continue;
        }

        output.push_str(&text[last..url.start]);
        output.push_str(&render_url(&new_url, url.form));
        last = url.end;
        count += 1;
    }

    output.push_str(&text[last..]);
    (output, count)
}

fn collect_urls<'i, 't>(parser: &mut Parser<'i, 't>, text: &str, urls: &mut Vec<CssUrl>) {
    let mut after_import = false;

    loop {
        let start = parser.position().byte_index();
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => break,
        };

        match &token {
            Token::UnquotedUrl(url) => {
                let end = parser.position().byte_index();
                urls.push(CssUrl::new(url.to_string(), start, end, UrlForm::Unquoted));
            }
            Token::Function(name) if name.eq_ignore_ascii_case("url") => {
                let quoted = parser.parse_nested_block(|nested| {
                    let mut quoted = None;
                    while let Ok(token) = nested.next() {
                        if let Token::QuotedString(value) = token {
                            quoted.get_or_insert_with(|| value.to_string());
                        }
                    }
                    Ok::<_, ParseError<'_, ()>>(quoted)
                });

                if let Ok(Some(url)) = quoted {
                    let end = parser.position().byte_index();
                    let quote = quote_in(&text[start..end]);
                    urls.push(CssUrl::new(url, start, end, UrlForm::QuotedFunction(quote)));
                }
            }
            Token::QuotedString(url) if after_import => {
                let end = parser.position().byte_index();
                let quote = quote_in(&text[start..end]);
                urls.push(CssUrl::new(url.to_string(), start, end, UrlForm::ImportString(quote)));
            }
            Token::Function(_)
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock
            | Token::CurlyBracketBlock => {
                let _ = parser.parse_nested_block(|nested| {
                    collect_urls(nested, text, urls);
                    Ok::<_, ParseError<'_, ()>>(())
                });
            }
            _ => {}
        }

        after_import = match &token {
            Token::AtKeyword(name) => name.eq_ignore_ascii_case("import"),
            Token::WhiteSpace(_) | Token::Comment(_) => after_import,
            _ => false,
        };
    }
}

fn quote_in(raw: &str) -> char {
    match raw.find(['"', '\'']) {
        Some(index) => raw[index..].chars().next().unwrap_or('"'),
        None => '"',
    }
}

impl CssUrl {
    fn new(url: String, start: usize, end: usize, form: UrlForm) -> Self {
        Self {
            url,
            start,
            end,
            line: 0,
            offset: 0,
            form,
        }
    }
}

fn render_url(url: &str, form: UrlForm) -> String {
    let needs_quotes = url
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '(' | ')' | '\\'));

    match form {
        UrlForm::Unquoted if !needs_quotes => format!("url({})", url),
        UrlForm::Unquoted => format!("url(\"{}\")", escape_string(url, '"')),
        UrlForm::QuotedFunction(quote) => {
            format!("url({quote}{}{quote})", escape_string(url, quote))
        }
        UrlForm::ImportString(quote) => format!("{quote}{}{quote}", escape_string(url, quote)),
    }
}

fn escape_string(value: &str, quote: char) -> String {
    let mut output = String::with_capacity(value.len());
    for c in value.chars() {
        if c == quote || c == '\\' {
            output.push('\\');
        }
        output.push(c);
    }
    output
}

#[cfg(test)]
mod tests {
    use crate::css::{Stylesheet, css_urls, rewrite_css_urls};

    const CSS: &str = r#"@charset "iso-8859-1";
@import "fonts.css";
@import url(print.css) print;
/* url(commented.png) */
body { background: url( ../Images/bg.png ); }
h1 { content: "url(not-a-link.png)"; }
@media screen {
  .logo { background-image: url('../Images/logo one.png'); }
}
"#;

    /// URLs are found in imports, nested blocks and both url() forms, never in comments or strings
    #[test]
    fn test_css_urls() {
        let urls = css_urls(CSS);
        let values = urls.iter().map(|u| u.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            values,
            vec!["fonts.css", "print.css", "../Images/bg.png", "../Images/logo one.png"]
        );

        assert_eq!(urls[0].line, 2);
        assert_eq!(urls[0].offset, 8);
        assert_eq!(urls[2].line, 5);
        assert_eq!(&CSS[urls[2].start..urls[2].end], "url( ../Images/bg.png )");
    }

    /// Rewriting replaces only the changed URLs and keeps the rest of the text
    #[test]
    fn test_rewrite_css_urls() {
        let (text, count) = rewrite_css_urls(CSS, &mut |url| match url {
            "fonts.css" => Some("styles/fonts.css".to_string()),
            "../Images/bg.png" => Some("../Images/back ground.png".to_string()),
            "../Images/logo one.png" => Some("../Images/logo.png".to_string()),
            other => Some(other.to_string()),
        });

        assert_eq!(count, 3);
        assert!(text.contains(r#"@import "styles/fonts.css";"#));
        assert!(text.contains(r#"background: url("../Images/back ground.png");"#));
        assert!(text.contains("url('../Images/logo.png')"));
        assert!(text.contains("@import url(print.css) print;"));
        assert!(text.contains("/* url(commented.png) */"));
    }

    /// Style attribute values are scanned like stylesheets
    #[test]
    fn test_style_attribute_urls() {
        let urls = css_urls("background: url(a.png) no-repeat; color: red");
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].url, "a.png");
        assert_eq!(urls[0].line, 1);
    }

    /// The charset rule is rewritten to UTF-8 on serialization
    #[test]
    fn test_serialize_charset() {
        let sheet = Stylesheet::new(CSS.to_string());
        let output = String::from_utf8(sheet.serialize()).unwrap();
        assert!(output.starts_with("@charset \"utf-8\";\n@import"));
    }
}
