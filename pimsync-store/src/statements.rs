use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::escape::escape_iri_component;
use crate::item::{ItemKind, LocalItem};

/// Fixed provenance IRI. Every resource the engine creates is tagged with
/// this data source so engine-owned triples can be told apart from anything
/// else living in the store.
pub const DATASOURCE_URN: &str = "urn:pimsync:datasource:8d1b7cd6-2a6e-4cf0-9c61-1b9f0e5a2d43";

const PREFIXES: &str = "\
PREFIX nie: <http://www.semanticdesktop.org/ontologies/2007/01/19/nie#>
PREFIX nmo: <http://www.semanticdesktop.org/ontologies/2007/03/22/nmo#>
PREFIX nfo: <http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#>
PREFIX nao: <http://www.semanticdesktop.org/ontologies/2007/08/15/nao#>
";

const RDFS_PREFIX: &str = "PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>\n";

#[derive(Debug, Error)]
pub enum StatementError {
    #[error("timestamp out of range: {0}")]
    TimestampRange(#[from] time::error::ComponentRange),
    #[error("timestamp format error: {0}")]
    TimestampFormat(#[from] time::error::Format),
}

/// Synthetic, stable IRI for a local item. Derived only from the kind and
/// the local identifier, so a later delete always targets the same IRI an
/// earlier insert created.
pub fn item_iri(kind: ItemKind, identifier: &str) -> String {
    format!(
        "urn:pimsync:{}:{}",
        kind.as_str(),
        escape_iri_component(identifier)
    )
}

pub fn format_datetime(secs: i64) -> Result<String, StatementError> {
    let moment = OffsetDateTime::from_unix_timestamp(secs)?;
    Ok(moment.format(&Rfc3339)?)
}

pub fn parse_datetime(value: &str) -> Result<i64, time::error::Parse> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(parsed.unix_timestamp())
}

/// Declares the engine's data-source resource. Submitted once during engine
/// initialization, before any item is pushed.
pub fn declare_data_source() -> String {
    format!(
        "{PREFIXES}INSERT {{ <{DATASOURCE_URN}> a nie:DataSource ; nao:identifier \"pimsync\" }}"
    )
}

/// Builds one batched insert statement for the given items. All free-text
/// fields pass through `escape` (the store client's escape function);
/// absent optional fields are omitted from the generated clause entirely.
pub fn build_insert<E>(items: &[LocalItem], escape: E) -> Result<String, StatementError>
where
    E: Fn(&str) -> String,
{
    let mut body = String::new();
    for item in items {
        let iri = item_iri(item.kind, &item.identifier);
        let mut clauses = Vec::new();
        match item.kind {
            ItemKind::Message => {
                clauses.push("a nmo:Email, nmo:MailboxDataObject, nie:InformationElement".into());
            }
            ItemKind::Bookmark => {
                clauses.push("a nfo:Bookmark, nie:InformationElement".into());
            }
        }
        clauses.push(format!("nie:dataSource <{DATASOURCE_URN}>"));
        clauses.push(format!("nao:identifier \"{}\"", escape(&item.identifier)));
        clauses.push(format!(
            "nie:contentLastModified \"{}\"",
            format_datetime(item.modified_secs())?
        ));
        if let Some(subject) = &item.subject {
            let predicate = match item.kind {
                ItemKind::Message => "nmo:messageSubject",
                ItemKind::Bookmark => "nie:title",
            };
            clauses.push(format!("{predicate} \"{}\"", escape(subject)));
        }
        if let Some(received_us) = item.received_us {
            let predicate = match item.kind {
                ItemKind::Message => "nmo:receivedDate",
                ItemKind::Bookmark => "nie:contentAccessed",
            };
            clauses.push(format!(
                "{predicate} \"{}\"",
                format_datetime(received_us.div_euclid(1_000_000))?
            ));
        }
        if let Some(url) = &item.url {
            clauses.push(format!("nie:url \"{}\"", escape(url)));
        }
        if let Some(sender) = &item.sender {
            clauses.push(format!("nmo:from <mailto:{}>", escape_iri_component(sender)));
        }
        if !item.recipients.is_empty() {
            let targets: Vec<String> = item
                .recipients
                .iter()
                .map(|address| format!("<mailto:{}>", escape_iri_component(address)))
                .collect();
            clauses.push(format!("nmo:to {}", targets.join(", ")));
        }
        if let Some(text) = &item.body {
            clauses.push(format!("nie:plainTextContent \"{}\"", escape(text)));
        }
        body.push_str(&format!("<{iri}> {} .\n", clauses.join(" ;\n    ")));
    }
    Ok(format!(
        "{PREFIXES}INSERT {{ GRAPH <{DATASOURCE_URN}> {{\n{body}}} }}"
    ))
}

/// Builds one batched delete statement targeting the given item IRIs.
pub fn build_delete<I, S>(iris: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let body: Vec<String> = iris
        .into_iter()
        .map(|iri| format!("<{}> a rdfs:Resource", iri.as_ref()))
        .collect();
    format!("{RDFS_PREFIX}DELETE {{ {} }}", body.join(" . "))
}

/// Query returning the full engine-owned remote snapshot: one row per
/// resource with its local identifier and store-resident timestamp.
pub fn snapshot_query() -> String {
    format!(
        "{PREFIXES}SELECT ?resource ?identifier ?modified WHERE {{ \
         ?resource nie:dataSource <{DATASOURCE_URN}> ; \
         nao:identifier ?identifier ; \
         nie:contentLastModified ?modified }}"
    )
}
