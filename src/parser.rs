use std::collections::HashSet;
use std::fs;

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use log::{debug, warn};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::alpha0,
    combinator::{all_consuming, opt, value},
    number::complete::double,
    sequence::{pair, terminated},
    IResult,
};
use regex::Regex;

use crate::circuit::{Circuit, NodeId};
use crate::component::{Component, ComponentType};

/// Largest node count a netlist may declare or imply
pub const MAX_NODES: usize = 1_000_000;

lazy_static! {
    static ref ELEMENT_PATTERN: Regex = Regex::new(r"^([A-Za-z])(\w*)\s+(.+)$").unwrap();
    static ref DIRECTIVE_PATTERN: Regex = Regex::new(r"^\.([A-Za-z]+)\s*(.*)$").unwrap();
}

/// Analyses requested by the netlist
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Operating,
    Transient { tstart: f64, tstop: f64 },
}

/// Parsed netlist, ready to be turned into a [`Circuit`]
#[derive(Debug, Clone, Default)]
pub struct Netlist {
    pub title: String,
    /// Explicit `.nodes`; otherwise derived from the highest node used
    pub nodes: Option<usize>,
    pub ground: NodeId,
    pub omega: f64,
    pub components: Vec<Component>,
    /// `.event` lines: switch name and toggle instants
    pub events: Vec<(String, Vec<f64>)>,
    pub analyses: Vec<Analysis>,
}

impl Netlist {
    pub fn node_count(&self) -> Result<usize> {
        if let Some(nodes) = self.nodes {
            return Ok(nodes);
        }
        let highest = self
            .components
            .iter()
            .flat_map(|c| c.nodes())
            .chain(std::iter::once(self.ground))
            .max()
            .unwrap_or(0);
        highest
            .checked_add(1)
            .ok_or_else(|| anyhow!("node {} is out of range", highest))
    }

    /// Build the circuit: register every element, then attach switch events
    pub fn build_circuit(&self) -> Result<Circuit> {
        let mut circuit = Circuit::new(self.node_count()?, self.ground)?
            .with_title(self.title.clone())
            .with_frequency(self.omega);

        for component in &self.components {
            circuit
                .add_component(component.clone())
                .with_context(|| format!("Failed to add '{}'", component.name))?;
        }

        for (name, times) in &self.events {
            let switch = circuit
                .component_id(name)
                .and_then(|id| circuit.switch_id(id))
                .ok_or_else(|| anyhow!("'.event' refers to '{}', which is not a switch", name))?;
            circuit.add_switch_events(switch, times)?;
        }

        Ok(circuit)
    }
}

/// Line-oriented netlist parser
#[derive(Debug, Default)]
pub struct NetlistParser;

impl NetlistParser {
    pub fn new() -> Self {
        NetlistParser
    }

    pub fn parse_file(&self, filename: &str) -> Result<Netlist> {
        let content = fs::read_to_string(filename)
            .with_context(|| format!("Failed to read file '{}'", filename))?;
        self.parse_netlist(&content)
    }

    pub fn parse_netlist(&self, content: &str) -> Result<Netlist> {
        let mut netlist = Netlist::default();
        let mut has_title = false;
        let mut names = HashSet::new();

        for (line_num, line) in self.preprocess_lines(content) {
            if !has_title && !line.starts_with('.') {
                netlist.title = line;
                has_title = true;
                continue;
            }

            if let Some(captures) = DIRECTIVE_PATTERN.captures(&line) {
                let directive = captures[1].to_lowercase();
                if directive == "end" {
                    break;
                }
                self.parse_directive(&mut netlist, &directive, &captures[2])
                    .with_context(|| format!("line {}: '{}'", line_num, line))?;
                continue;
            }

            let component = self
                .parse_element(&line)
                .with_context(|| format!("line {}: '{}'", line_num, line))?;
            if !names.insert(component.name.clone()) {
                bail!("line {}: '{}': element '{}' is already defined", line_num, line, component.name);
            }
            debug!("Parsed {} {:?}", component.name, component.component_type);
            netlist.components.push(component);
        }

        Ok(netlist)
    }

    fn parse_element(&self, line: &str) -> Result<Component> {
        let captures = ELEMENT_PATTERN
            .captures(line)
            .ok_or_else(|| anyhow!("Unrecognised element line"))?;
        let letter = captures[1].to_ascii_uppercase();
        let name = format!("{}{}", letter, captures[2].to_uppercase());
        let fields: Vec<&str> = captures[3].split_whitespace().collect();

        let component_type = match letter.as_str() {
            "R" => {
                expect_fields(&fields, 3, "R a b value")?;
                ComponentType::Resistor {
                    resistance: parse_value(fields[2])?,
                }
            }
            "C" => {
                expect_fields(&fields, 3, "C a b value")?;
                ComponentType::Capacitor {
                    capacitance: parse_value(fields[2])?,
                }
            }
            "L" => {
                expect_fields(&fields, 3, "L a b value")?;
                ComponentType::Inductor {
                    inductance: parse_value(fields[2])?,
                }
            }
            "V" | "I" => {
                // optional DC keyword before the value
                let value_field = match fields.as_slice() {
                    [_, _, dc, v] if dc.eq_ignore_ascii_case("dc") => *v,
                    [_, _, v] => *v,
                    _ => bail!("expected '{} head tail [DC] value'", letter),
                };
                let value = parse_value(value_field)?;
                if letter == "V" {
                    ComponentType::VoltageSource { voltage: value }
                } else {
                    ComponentType::CurrentSource { current: value }
                }
            }
            "E" => {
                expect_fields(&fields, 5, "E head tail sense+ sense- gain")?;
                ComponentType::DependentVoltageSource {
                    gain: parse_value(fields[4])?,
                    sense_plus: parse_node(fields[2])?,
                    sense_minus: parse_node(fields[3])?,
                }
            }
            "W" => {
                expect_fields(&fields, 2, "W a b")?;
                ComponentType::Wire
            }
            "S" => {
                let initially_closed = match fields.get(2).map(|s| s.to_lowercase()) {
                    None => false,
                    Some(state) if state == "open" => false,
                    Some(state) if state == "closed" => true,
                    Some(state) => bail!("switch state must be 'open' or 'closed', got '{}'", state),
                };
                if !(2..=3).contains(&fields.len()) {
                    bail!("expected 'S a b [open|closed]'");
                }
                ComponentType::Switch { initially_closed }
            }
            "P" => {
                let initially_b = match fields.get(3).map(|s| s.to_lowercase()) {
                    None => false,
                    Some(throw) if throw == "a" => false,
                    Some(throw) if throw == "b" => true,
                    Some(throw) => bail!("SPDT position must be 'a' or 'b', got '{}'", throw),
                };
                if !(3..=4).contains(&fields.len()) {
                    bail!("expected 'P pole throwA throwB [a|b]'");
                }
                ComponentType::SpdtSwitch {
                    throw_b: parse_node(fields[2])?,
                    initially_b,
                }
            }
            other => bail!("Unknown element type '{}'", other),
        };

        Ok(Component::new(
            name,
            component_type,
            parse_node(fields[0])?,
            parse_node(fields[1])?,
        ))
    }

    fn parse_directive(&self, netlist: &mut Netlist, directive: &str, args: &str) -> Result<()> {
        let fields: Vec<&str> = args.split_whitespace().collect();
        match directive {
            "nodes" => {
                expect_fields(&fields, 1, ".nodes N")?;
                let nodes: usize = fields[0]
                    .parse()
                    .with_context(|| format!("Invalid node count '{}'", fields[0]))?;
                if nodes > MAX_NODES {
                    bail!("node count {} exceeds the limit of {}", nodes, MAX_NODES);
                }
                netlist.nodes = Some(nodes);
            }
            "ground" => {
                expect_fields(&fields, 1, ".ground G")?;
                netlist.ground = parse_node(fields[0])?;
            }
            "omega" => {
                expect_fields(&fields, 1, ".omega W")?;
                netlist.omega = parse_value(fields[0])?;
            }
            "event" => {
                let (name, times) = fields
                    .split_first()
                    .ok_or_else(|| anyhow!("expected '.event Sname t1 t2 ...'"))?;
                let times = times
                    .iter()
                    .map(|t| parse_value(t))
                    .collect::<Result<Vec<_>>>()?;
                netlist.events.push((name.to_uppercase(), times));
            }
            "op" => netlist.analyses.push(Analysis::Operating),
            "tran" => {
                let (tstart, tstop) = match fields.as_slice() {
                    [tstop] => (0.0, parse_value(tstop)?),
                    [tstart, tstop] => (parse_value(tstart)?, parse_value(tstop)?),
                    _ => bail!("expected '.tran [tstart] tstop'"),
                };
                netlist.analyses.push(Analysis::Transient { tstart, tstop });
            }
            other => warn!("Ignoring unsupported directive '.{}'", other),
        }
        Ok(())
    }

    /// Drop blanks and comments, join `+` continuations. Keeps the number of
    /// the line each logical line starts on.
    fn preprocess_lines(&self, content: &str) -> Vec<(usize, String)> {
        let mut processed_lines: Vec<(usize, String)> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = match raw.find(';') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();

            if line.is_empty() || line.starts_with('*') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('+') {
                if let Some((_, current)) = processed_lines.last_mut() {
                    current.push(' ');
                    current.push_str(rest.trim());
                    continue;
                }
            }
            processed_lines.push((index + 1, line.to_string()));
        }

        processed_lines
    }
}

fn expect_fields(fields: &[&str], count: usize, usage: &str) -> Result<()> {
    if fields.len() != count {
        bail!("expected '{}', got {} field(s)", usage, fields.len());
    }
    Ok(())
}

fn parse_node(field: &str) -> Result<NodeId> {
    let node: NodeId = field
        .parse()
        .with_context(|| format!("Invalid node '{}': nodes are non-negative integers", field))?;
    if node >= MAX_NODES {
        bail!("node {} exceeds the limit of {} nodes", node, MAX_NODES);
    }
    Ok(node)
}

fn si_scale(input: &str) -> IResult<&str, f64> {
    alt((
        value(1e6, tag_no_case("meg")),
        value(1e-15, tag_no_case("f")),
        value(1e-12, tag_no_case("p")),
        value(1e-9, tag_no_case("n")),
        value(1e-6, tag_no_case("u")),
        value(1e-3, tag_no_case("m")),
        value(1e3, tag_no_case("k")),
        value(1e9, tag_no_case("g")),
        value(1e12, tag_no_case("t")),
    ))(input)
}

/// Number, optional SI scale, then any unit letters (ignored)
fn si_number(input: &str) -> IResult<&str, f64> {
    let (input, (number, scale)) = terminated(pair(double, opt(si_scale)), alpha0)(input)?;
    Ok((input, number * scale.unwrap_or(1.0)))
}

/// Parse a value with an optional SI suffix (e.g. `1k`, `4.7u`, `2meg`, `10mA`)
pub fn parse_value(field: &str) -> Result<f64> {
    all_consuming(si_number)(field.trim())
        .map(|(_, value)| value)
        .map_err(|_| anyhow!("Invalid value '{}'", field))
}
