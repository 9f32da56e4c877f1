use anyhow::{Context, Result};
use ecu_synth_indexing::{IoQuery, MatchOutcome};
use ecu_synth_schemas::{DocumentCategory, Element, IdempotencyRecord, IoSignal};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::IO_LISTS_FOLDER;
use crate::database::Relation;
use crate::documents::{content_digest, file_name, list_files};
use crate::pipeline::{PipelineServices, RunContext};
use crate::stages::fan_out;
use crate::worker::{WorkingSetDelta, WorkingSetHandle};

/// IO signals of a `PtIOList`, keyed by the list's own system.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIoList {
    pub family: String,
    pub execution: String,
    pub ios: Vec<IoQuery>,
}

pub fn parse_io_list(root: &Element) -> Result<ParsedIoList> {
    if root.name != "PtIOList" {
        anyhow::bail!("Expected PtIOList, found <{}>", root.name);
    }
    let text = |element: &Element, path: &str| {
        element
            .path(path)
            .map(|e| e.text().trim().to_string())
            .unwrap_or_default()
    };

    let ios = root
        .children_named("IO")
        .map(|io| IoQuery {
            name: text(io, "Name"),
            name_presentation: text(io, "NamePresentation"),
            description: text(io, "IOService/Description"),
        })
        .filter(|io| !io.name.is_empty())
        .collect();

    Ok(ParsedIoList {
        family: text(root, "EcuSystemFamily"),
        execution: text(root, "EcuSystemExecution"),
        ios,
    })
}

pub async fn map_io_lists(services: &PipelineServices, ctx: &mut RunContext) -> Result<()> {
    let dir = ctx.folders.input_category(IO_LISTS_FOLDER);
    let files = list_files(&dir, "xml")?;
    if files.is_empty() {
        ctx.audit.record(format!("No IO lists found in {}", dir.display()));
        return Ok(());
    }
    ctx.audit.record(format!("Found {} IO lists", files.len()));

    let ecu_system = ctx.ecu_system().to_string();
    let excluded: Arc<Vec<String>> = Arc::new(ctx.excluded_circuits().into_iter().collect());
    let aggregator = WorkingSetHandle::spawn(std::mem::take(&mut ctx.working_set));

    for path in files {
        let filename = file_name(&path);
        let hash = content_digest(&path)?;
        if ctx.ledger.is_processed(DocumentCategory::IoList, &hash, &ecu_system) {
            ctx.audit
                .record(format!("Skipping {} as it has already been processed", filename));
            continue;
        }

        let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed = match Element::parse_bytes(&bytes).and_then(|root| parse_io_list(&root)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unreadable IO list {}: {:#}", filename, e);
                ctx.audit
                    .record(format!("Skipping {} as it is not a valid IO list", filename));
                continue;
            }
        };
        if parsed.family != ctx.meta.family || parsed.execution != ctx.meta.execution {
            ctx.audit.record(format!(
                "Skipping {} as it belongs to {}/{} instead of {}/{}",
                filename, parsed.family, parsed.execution, ctx.meta.family, ctx.meta.execution
            ));
            continue;
        }
        ctx.progress(format!("Processing {}", filename));

        let io_names: Vec<String> = parsed.ios.iter().map(|io| io.name.clone()).collect();
        let matched = match_ios(services, ctx, parsed.ios, excluded.clone(), &aggregator).await?;
        ctx.audit.record(format!(
            "Mapped {} of {} IO(s) from {}",
            matched,
            io_names.len(),
            filename
        ));

        {
            let db = services.db.lock().await;
            for name in &io_names {
                db.link(Relation::Contains, &ecu_system, &hash.0, name)?;
            }
        }

        ctx.ledger
            .record(
                DocumentCategory::IoList,
                IdempotencyRecord {
                    content_hash: hash,
                    filename,
                    ecu_system: ecu_system.clone(),
                },
            )
            .await?;
    }

    ctx.working_set = aggregator.finish().await?;
    Ok(())
}

/// Store and match every IO; returns how many found a component.
async fn match_ios(
    services: &PipelineServices,
    ctx: &RunContext,
    ios: Vec<IoQuery>,
    excluded: Arc<Vec<String>>,
    aggregator: &WorkingSetHandle,
) -> Result<usize> {
    let db = services.db.clone();
    let matcher = services.matcher.clone();
    let audit = ctx.audit.clone();
    let deltas = aggregator.sender();
    let ecu_system = ctx.ecu_system().to_string();

    let outcomes = fan_out(&services.config, "io mapping", ios, move |io| {
        let db = db.clone();
        let matcher = matcher.clone();
        let audit = audit.clone();
        let deltas = deltas.clone();
        let excluded = excluded.clone();
        let ecu_system = ecu_system.clone();
        async move {
            db.lock().await.upsert_io(&IoSignal {
                name: io.name.clone(),
                description: io.description.clone(),
                name_presentation: io.name_presentation.clone(),
                ecu_system: ecu_system.clone(),
            })?;

            match matcher.match_io(&io, &ecu_system, &excluded).await? {
                MatchOutcome::Matched { component, reason } => {
                    {
                        let db = db.lock().await;
                        db.link(Relation::MappedTo, &ecu_system, &io.name, &component)?;
                        db.set_component_exported(&component, &ecu_system, false)?;
                    }
                    audit.record(format!("IO {} matched with component {}: {}", io.name, component, reason));
                    if deltas
                        .send(WorkingSetDelta::AddIo {
                            component,
                            io: io.name,
                        })
                        .is_err()
                    {
                        debug!("Working set aggregator closed before the IO mapping ended");
                    }
                    Ok(true)
                }
                MatchOutcome::NoMatch { reason } => {
                    audit.record(format!("No component for IO {}: {}", io.name, reason));
                    Ok(false)
                }
            }
        }
    })
    .await?;

    Ok(outcomes.into_iter().filter(|matched| *matched).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IO_LIST: &str = r#"<PtIOList>
  <Name>TPM2</Name>
  <EcuSystemFamily ref="PtEcuSystemFamily">TPM</EcuSystemFamily>
  <EcuSystemExecution ref="PtEcuSystemExecution">TPM2</EcuSystemExecution>
  <IO>
    <Name>IO_PIN_EL_POS_VOLT</Name>
    <NamePresentation edt="nfTxt">Pin el position voltage</NamePresentation>
    <IOService>
      <Name>IO_PIN_EL_POS_VOLT-readIO</Name>
      <Description edt="fTxt">Voltage of the clutch position sensor</Description>
    </IOService>
  </IO>
  <IO>
    <Name>IO_FAN</Name>
  </IO>
</PtIOList>"#;

    #[test]
    fn test_parse_io_list() {
        let parsed = parse_io_list(&Element::parse(IO_LIST).unwrap()).unwrap();
        assert_eq!(parsed.family, "TPM");
        assert_eq!(parsed.execution, "TPM2");
        assert_eq!(parsed.ios.len(), 2);
        assert_eq!(parsed.ios[0].name_presentation, "Pin el position voltage");
        assert_eq!(parsed.ios[0].description, "Voltage of the clutch position sensor");
        assert_eq!(parsed.ios[1].description, "");
    }

    #[test]
    fn test_unnamed_ios_are_dropped() {
        let parsed = parse_io_list(
            &Element::parse(
                "<PtIOList><EcuSystemFamily>TPM</EcuSystemFamily><EcuSystemExecution>TPM2</EcuSystemExecution>\
                 <IO><Name> IO_FAN </Name></IO><IO><NamePresentation>Orphan</NamePresentation></IO></PtIOList>",
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            parsed,
            ParsedIoList {
                family: "TPM".to_string(),
                execution: "TPM2".to_string(),
                ios: vec![IoQuery {
                    name: "IO_FAN".to_string(),
                    ..IoQuery::default()
                }],
            }
        );
    }

    #[test]
    fn test_rejects_other_documents() {
        assert!(parse_io_list(&Element::parse("<PtCircuit/>").unwrap()).is_err());
    }
}
