//! Permission and governance documents for the pub/sub bus.
//!
//! Both documents are XML in the DDS-security style, rendered
//! deterministically and signed by the permissions CA. The topic table per
//! key type is fixed.

use crate::key_id::KeyType;
use uvn_types::UvnTopic;

/// Topics an entity may publish and subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGrants {
    pub publish: Vec<UvnTopic>,
    pub subscribe: Vec<UvnTopic>,
}

/// The fixed topic table.
///
/// The registry announces the UVN and pushes configuration; cells announce
/// themselves and listen for everything. Particles never join the bus.
pub fn topic_grants(kind: KeyType) -> TopicGrants {
    match kind {
        KeyType::Root => TopicGrants {
            publish: vec![UvnTopic::UvnId, UvnTopic::Backbone],
            subscribe: vec![UvnTopic::CellId],
        },
        KeyType::Cell => TopicGrants {
            publish: vec![UvnTopic::CellId],
            subscribe: vec![UvnTopic::CellId, UvnTopic::UvnId, UvnTopic::Backbone],
        },
        KeyType::Particle => TopicGrants {
            publish: Vec::new(),
            subscribe: Vec::new(),
        },
    }
}

fn format_ts(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| unix.to_string())
}

fn topics_block(indent: &str, topics: &[UvnTopic]) -> String {
    if topics.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for topic in topics {
        out.push_str(indent);
        out.push_str("<topic>");
        out.push_str(topic.as_str());
        out.push_str("</topic>\n");
    }
    out
}

/// Render the permissions document for one entity.
pub fn render_permissions(
    grant_name: &str,
    subject_cn: &str,
    organization: &str,
    dds_domain: u32,
    not_before: i64,
    not_after: i64,
    grants: &TopicGrants,
) -> String {
    let mut rules = String::new();
    if !grants.publish.is_empty() {
        rules.push_str("        <publish>\n          <topics>\n");
        rules.push_str(&topics_block("            ", &grants.publish));
        rules.push_str("          </topics>\n        </publish>\n");
    }
    if !grants.subscribe.is_empty() {
        rules.push_str("        <subscribe>\n          <topics>\n");
        rules.push_str(&topics_block("            ", &grants.subscribe));
        rules.push_str("          </topics>\n        </subscribe>\n");
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<dds>
  <permissions>
    <grant name="{grant_name}">
      <subject_name>CN={subject_cn}, O={organization}</subject_name>
      <validity>
        <not_before>{not_before}</not_before>
        <not_after>{not_after}</not_after>
      </validity>
      <allow_rule>
        <domains>
          <id>{dds_domain}</id>
        </domains>
{rules}      </allow_rule>
      <default>DENY</default>
    </grant>
  </permissions>
</dds>
"#,
        grant_name = grant_name,
        subject_cn = subject_cn,
        organization = organization,
        dds_domain = dds_domain,
        not_before = format_ts(not_before),
        not_after = format_ts(not_after),
        rules = rules,
    )
}

/// Render the shared governance document.
pub fn render_governance(organization: &str, dds_domain: u32, secure: bool) -> String {
    let protection = if secure { "ENCRYPT" } else { "NONE" };
    let mut topic_rules = String::new();
    for topic in UvnTopic::ALL {
        topic_rules.push_str(&format!(
            r#"          <topic_rule>
            <topic_expression>{}</topic_expression>
            <enable_discovery_protection>{}</enable_discovery_protection>
            <enable_liveliness_protection>{}</enable_liveliness_protection>
            <enable_read_access_control>true</enable_read_access_control>
            <enable_write_access_control>true</enable_write_access_control>
            <metadata_protection_kind>{}</metadata_protection_kind>
            <data_protection_kind>{}</data_protection_kind>
          </topic_rule>
"#,
            topic.as_str(),
            secure,
            secure,
            protection,
            protection,
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<dds>
  <governance organization="{organization}">
    <domain_access_rules>
      <domain_rule>
        <domains>
          <id>{dds_domain}</id>
        </domains>
        <allow_unauthenticated_participants>false</allow_unauthenticated_participants>
        <enable_join_access_control>true</enable_join_access_control>
        <discovery_protection_kind>{protection}</discovery_protection_kind>
        <liveliness_protection_kind>{protection}</liveliness_protection_kind>
        <rtps_protection_kind>{protection}</rtps_protection_kind>
        <topic_access_rules>
{topic_rules}        </topic_access_rules>
      </domain_rule>
    </domain_access_rules>
  </governance>
</dds>
"#,
        organization = organization,
        dds_domain = dds_domain,
        protection = protection,
        topic_rules = topic_rules,
    )
}
