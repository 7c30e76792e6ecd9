//! Prompt templates for focus extraction, in Chinese and English.

use wiseflow_core::FocusPoint;

fn focus_statement(focus: &FocusPoint, zh: bool) -> String {
    let explanation = focus.explanation.trim();
    match (zh, explanation.is_empty()) {
        (true, true) => format!("关注点：{}", focus.focus.trim()),
        (true, false) => format!("关注点：{}\n说明：{}", focus.focus.trim(), explanation),
        (false, true) => format!("Focus point: {}", focus.focus.trim()),
        (false, false) => format!(
            "Focus point: {}\nExplanation: {}",
            focus.focus.trim(),
            explanation
        ),
    }
}

pub fn related_urls_system(focus: &FocusPoint, zh: bool) -> String {
    let fp = focus_statement(focus, zh);
    if zh {
        format!(
            "你是一个高效的信息筛选助手。下面是从网页中提取的链接列表，每行是链接文本，末尾带有形如 [3] 的引用标记。\n\
             请挑出可能与以下关注点相关的链接：\n\n{fp}\n\n\
             只输出相关链接的引用标记，每行一个，例如：\n[3]\n[12]\n\
             如果没有相关链接，输出 NA。不要输出任何解释。"
        )
    } else {
        format!(
            "You are an efficient information filtering assistant. Below is a list of links \
             extracted from a web page; each line is the link text followed by a reference marker such as [3].\n\
             Pick out the links that may be related to the following focus point:\n\n{fp}\n\n\
             Output only the reference markers of the relevant links, one per line, for example:\n[3]\n[12]\n\
             If no link is relevant, output NA. Do not add any explanation."
        )
    }
}

pub fn related_urls_user(chunk: &str, zh: bool) -> String {
    if zh {
        format!("<链接列表>\n{chunk}\n</链接列表>")
    } else {
        format!("<links>\n{chunk}\n</links>")
    }
}

pub fn info_system(focus: &FocusPoint, zh: bool) -> String {
    let fp = focus_statement(focus, zh);
    if zh {
        format!(
            "你是一名专业的信息提炼助手。请从给定的网页文本中提取与以下关注点相关的信息：\n\n{fp}\n\n\
             要求：\n\
             1. 每条信息需完整、独立，包含必要的背景（时间、地点、主体）。\n\
             2. 保留原文中作为出处的引用标记（如 [3]、[img2]），放在对应信息的末尾。\n\
             3. 与关注点无关的内容不要输出。\n\
             以 JSON 数组输出，每个元素形如 {{\"content\": \"信息内容[3]\"}}；如果没有相关信息，输出 []。"
        )
    } else {
        format!(
            "You are a professional information extraction assistant. Extract the information \
             related to the following focus point from the given web page text:\n\n{fp}\n\n\
             Requirements:\n\
             1. Each item must be complete and self-contained, including the necessary context (time, place, subject).\n\
             2. Keep the reference markers from the text (such as [3] or [img2]) that support an item at the end of that item.\n\
             3. Do not output anything unrelated to the focus point.\n\
             Answer with a JSON array whose elements look like {{\"content\": \"the information[3]\"}}; \
             if nothing is relevant, answer []."
        )
    }
}

pub fn info_user(chunk: &str, author: &str, publish_date: &str, zh: bool) -> String {
    let mut context = String::new();
    if zh {
        if !author.is_empty() {
            context.push_str(&format!("来源：{author}\n"));
        }
        if !publish_date.is_empty() {
            context.push_str(&format!("发布日期：{publish_date}\n"));
        }
        format!("{context}<网页文本>\n{chunk}\n</网页文本>")
    } else {
        if !author.is_empty() {
            context.push_str(&format!("Source: {author}\n"));
        }
        if !publish_date.is_empty() {
            context.push_str(&format!("Published: {publish_date}\n"));
        }
        format!("{context}<text>\n{chunk}\n</text>")
    }
}

pub fn author_date_system(zh: bool) -> String {
    if zh {
        "你是一名网页元信息识别助手。请根据给定的网页文本开头部分，识别文章的来源（作者或发布机构）与发布日期。\n\
         以 JSON 对象输出：{\"source\": \"来源\", \"publish_date\": \"YYYY-MM-DD\"}。\n\
         无法确定的字段填 NA。不要输出任何解释。"
            .to_string()
    } else {
        "You identify page metadata. From the beginning of the given web page text, determine the \
         source (author or publishing organization) and the publication date.\n\
         Answer with a JSON object: {\"source\": \"the source\", \"publish_date\": \"YYYY-MM-DD\"}.\n\
         Use NA for any field you cannot determine. Do not add any explanation."
            .to_string()
    }
}

pub fn author_date_user(head: &str, zh: bool) -> String {
    if zh {
        format!("<网页文本>\n{head}\n</网页文本>")
    } else {
        format!("<text>\n{head}\n</text>")
    }
}
